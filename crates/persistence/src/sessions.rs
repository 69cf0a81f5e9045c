use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{AgentPresence, AgentSession};
use uuid::Uuid;

use crate::InboxStore;

type SessionRow = (String, String, String, String, DateTime<Utc>, DateTime<Utc>);

const SESSION_COLUMNS: &str = "id, agent_id, connection_id, status, last_seen_at, created_at";

fn session_from_row(row: SessionRow) -> Result<AgentSession> {
    let (id, agent_id, connection_id, status, last_seen_at, created_at) = row;
    Ok(AgentSession {
        id: Uuid::parse_str(&id)?,
        agent_id: Uuid::parse_str(&agent_id)?,
        connection_id,
        status: AgentPresence::parse(&status)
            .ok_or_else(|| anyhow!("bad session status: {}", status))?,
        last_seen_at,
        created_at,
    })
}

impl InboxStore {
    /// One session row per socket connection; an agent may hold several
    /// across devices. Reconnects with the same connection id refresh the
    /// existing row.
    pub async fn open_agent_session(
        &self,
        agent_id: Uuid,
        connection_id: &str,
    ) -> Result<AgentSession> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO agent_sessions (id, agent_id, connection_id, status, last_seen_at, created_at)
            VALUES (?, ?, ?, 'ONLINE', ?, ?)
            ON CONFLICT (connection_id) DO UPDATE SET
                status = 'ONLINE',
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id.to_string())
        .bind(connection_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to open agent session")?;

        self.agent_session(connection_id)
            .await?
            .ok_or_else(|| anyhow!("session vanished after upsert"))
    }

    pub async fn agent_session(&self, connection_id: &str) -> Result<Option<AgentSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM agent_sessions WHERE connection_id = ?",
            SESSION_COLUMNS
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch agent session")?;

        row.map(session_from_row).transpose()
    }

    pub async fn set_session_status(
        &self,
        connection_id: &str,
        status: AgentPresence,
    ) -> Result<Option<AgentSession>> {
        let updated = sqlx::query(
            "UPDATE agent_sessions SET status = ?, last_seen_at = ? WHERE connection_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .context("failed to update session status")?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.agent_session(connection_id).await
    }

    pub async fn close_agent_session(&self, connection_id: &str) -> Result<Option<AgentSession>> {
        let session = self.agent_session(connection_id).await?;
        if session.is_some() {
            sqlx::query("DELETE FROM agent_sessions WHERE connection_id = ?")
                .bind(connection_id)
                .execute(&self.pool)
                .await
                .context("failed to close agent session")?;
        }
        Ok(session)
    }
}
