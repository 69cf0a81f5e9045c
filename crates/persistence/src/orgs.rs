use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{AgentRef, AgentRole, Organization};
use uuid::Uuid;

use crate::InboxStore;

impl InboxStore {
    pub async fn create_organization(&self, slug: &str, name: &str) -> Result<Organization> {
        let org = Organization {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO organizations (id, slug, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(org.id.to_string())
            .bind(&org.slug)
            .bind(&org.name)
            .bind(org.created_at)
            .execute(&self.pool)
            .await
            .context("failed to insert organization")?;

        Ok(org)
    }

    pub async fn organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let row: Option<(String, String, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, slug, name, created_at FROM organizations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("failed to fetch organization")?;

        row.map(|(id, slug, name, created_at)| {
            Ok(Organization { id: Uuid::parse_str(&id)?, slug, name, created_at })
        })
        .transpose()
    }

    pub async fn create_agent(
        &self,
        organization_id: Uuid,
        display_name: &str,
        role: AgentRole,
    ) -> Result<AgentRef> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO agents (id, organization_id, display_name, role, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(organization_id.to_string())
        .bind(display_name)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert agent")?;

        Ok(AgentRef { id, display_name: display_name.to_string(), role })
    }

    pub async fn agent_ref(&self, id: Uuid) -> Result<Option<AgentRef>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, display_name, role FROM agents WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("failed to fetch agent")?;

        row.map(|(id, display_name, role)| {
            Ok(AgentRef {
                id: Uuid::parse_str(&id)?,
                display_name,
                role: AgentRole::parse(&role).ok_or_else(|| anyhow!("bad agent role: {}", role))?,
            })
        })
        .transpose()
    }
}
