use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{Contact, Provider};
use uuid::Uuid;

use crate::{parse_json, InboxStore};

type ContactRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

const CONTACT_COLUMNS: &str =
    "id, organization_id, provider, provider_id, display_name, metadata, last_seen_at, created_at";

pub(crate) fn contact_from_row(row: ContactRow) -> Result<Contact> {
    let (id, organization_id, provider, provider_id, display_name, metadata, last_seen_at, created_at) =
        row;
    Ok(Contact {
        id: Uuid::parse_str(&id)?,
        organization_id: Uuid::parse_str(&organization_id)?,
        provider: Provider::parse(&provider)
            .ok_or_else(|| anyhow!("bad contact provider: {}", provider))?,
        provider_id,
        display_name,
        metadata: parse_json(metadata),
        last_seen_at,
        created_at,
    })
}

impl InboxStore {
    /// Insert-or-refresh keyed by (organization, provider, provider id).
    /// The display name is adopted only when previously unknown, so a later
    /// payload without a profile name does not erase one we already have.
    pub async fn upsert_contact(
        &self,
        organization_id: Uuid,
        provider: Provider,
        provider_id: &str,
        display_name: Option<&str>,
    ) -> Result<Contact> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO contacts (id, organization_id, provider, provider_id, display_name, metadata, last_seen_at, created_at)
            VALUES (?, ?, ?, ?, ?, '{}', ?, ?)
            ON CONFLICT (organization_id, provider, provider_id) DO UPDATE SET
                display_name = COALESCE(contacts.display_name, excluded.display_name),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(organization_id.to_string())
        .bind(provider.as_str())
        .bind(provider_id)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to upsert contact")?;

        self.contact_by_provider_id(organization_id, provider, provider_id)
            .await?
            .ok_or_else(|| anyhow!("contact vanished after upsert"))
    }

    pub async fn contact(&self, id: Uuid) -> Result<Option<Contact>> {
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {} FROM contacts WHERE id = ?",
            CONTACT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch contact")?;

        row.map(contact_from_row).transpose()
    }

    pub async fn contact_by_provider_id(
        &self,
        organization_id: Uuid,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<Contact>> {
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {} FROM contacts WHERE organization_id = ? AND provider = ? AND provider_id = ?",
            CONTACT_COLUMNS
        ))
        .bind(organization_id.to_string())
        .bind(provider.as_str())
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch contact by provider id")?;

        row.map(contact_from_row).transpose()
    }
}
