use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{
    AgentRef, AgentRole, ChannelRef, Contact, Conversation, ConversationEvent,
    ConversationEventType, ConversationStatus, ConversationWithRelations, Provider,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::{parse_json, InboxStore};

type ConversationRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const CONVERSATION_COLUMNS: &str = "id, organization_id, channel_id, contact_id, status, \
     assigned_agent_id, last_message_at, first_response_at, created_at, updated_at";

fn conversation_from_row(row: ConversationRow) -> Result<Conversation> {
    let (
        id,
        organization_id,
        channel_id,
        contact_id,
        status,
        assigned_agent_id,
        last_message_at,
        first_response_at,
        created_at,
        updated_at,
    ) = row;
    Ok(Conversation {
        id: Uuid::parse_str(&id)?,
        organization_id: Uuid::parse_str(&organization_id)?,
        channel_id: Uuid::parse_str(&channel_id)?,
        contact_id: Uuid::parse_str(&contact_id)?,
        status: ConversationStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad conversation status: {}", status))?,
        assigned_agent_id: assigned_agent_id.map(|s| Uuid::parse_str(&s)).transpose()?,
        last_message_at,
        first_response_at,
        created_at,
        updated_at,
    })
}

fn relations_from_row(row: &SqliteRow) -> Result<ConversationWithRelations> {
    let conversation = conversation_from_row((
        row.try_get("id")?,
        row.try_get("organization_id")?,
        row.try_get("channel_id")?,
        row.try_get("contact_id")?,
        row.try_get("status")?,
        row.try_get("assigned_agent_id")?,
        row.try_get("last_message_at")?,
        row.try_get("first_response_at")?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
    ))?;

    let ct_provider: String = row.try_get("ct_provider")?;
    let contact = Contact {
        id: Uuid::parse_str(row.try_get::<&str, _>("ct_id")?)?,
        organization_id: conversation.organization_id,
        provider: Provider::parse(&ct_provider)
            .ok_or_else(|| anyhow!("bad contact provider: {}", ct_provider))?,
        provider_id: row.try_get("ct_provider_id")?,
        display_name: row.try_get("ct_display_name")?,
        metadata: parse_json(row.try_get("ct_metadata")?),
        last_seen_at: row.try_get("ct_last_seen_at")?,
        created_at: row.try_get("ct_created_at")?,
    };

    let ch_provider: String = row.try_get("ch_provider")?;
    let channel = ChannelRef {
        id: conversation.channel_id,
        provider: Provider::parse(&ch_provider)
            .ok_or_else(|| anyhow!("bad channel provider: {}", ch_provider))?,
    };

    let assigned_agent = match row.try_get::<Option<String>, _>("ag_id")? {
        Some(id) => {
            let role: String = row.try_get("ag_role")?;
            Some(AgentRef {
                id: Uuid::parse_str(&id)?,
                display_name: row.try_get("ag_display_name")?,
                role: AgentRole::parse(&role).ok_or_else(|| anyhow!("bad agent role: {}", role))?,
            })
        }
        None => None,
    };

    Ok(ConversationWithRelations { conversation, contact, channel, assigned_agent })
}

const RELATION_SELECT: &str = r#"
SELECT cv.id, cv.organization_id, cv.channel_id, cv.contact_id, cv.status,
       cv.assigned_agent_id, cv.last_message_at, cv.first_response_at,
       cv.created_at, cv.updated_at,
       ct.id AS ct_id, ct.provider AS ct_provider, ct.provider_id AS ct_provider_id,
       ct.display_name AS ct_display_name, ct.metadata AS ct_metadata,
       ct.last_seen_at AS ct_last_seen_at, ct.created_at AS ct_created_at,
       ch.provider AS ch_provider,
       ag.id AS ag_id, ag.display_name AS ag_display_name, ag.role AS ag_role
FROM conversations cv
JOIN contacts ct ON ct.id = cv.contact_id
JOIN channels ch ON ch.id = cv.channel_id
LEFT JOIN agents ag ON ag.id = cv.assigned_agent_id
"#;

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub channel_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

pub(crate) async fn append_event_tx(
    conn: &mut SqliteConnection,
    conversation_id: Uuid,
    event_type: ConversationEventType,
    actor_id: Option<Uuid>,
    metadata: Value,
) -> Result<ConversationEvent> {
    let event = ConversationEvent {
        id: Uuid::new_v4(),
        conversation_id,
        event_type,
        actor_id,
        metadata,
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO conversation_events (id, conversation_id, event_type, actor_id, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(event.conversation_id.to_string())
    .bind(event.event_type.as_str())
    .bind(event.actor_id.map(|id| id.to_string()))
    .bind(event.metadata.to_string())
    .bind(event.created_at)
    .execute(conn)
    .await
    .context("failed to append conversation event")?;

    Ok(event)
}

impl InboxStore {
    /// Create a fresh PENDING conversation and its CREATED audit row in one
    /// transaction.
    pub async fn create_conversation(
        &self,
        organization_id: Uuid,
        channel_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            organization_id,
            channel_id,
            contact_id,
            status: ConversationStatus::Pending,
            assigned_agent_id: None,
            last_message_at: None,
            first_response_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, organization_id, channel_id, contact_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.organization_id.to_string())
        .bind(conversation.channel_id.to_string())
        .bind(conversation.contact_id.to_string())
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert conversation")?;

        append_event_tx(
            &mut tx,
            conversation.id,
            ConversationEventType::Created,
            None,
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;
        Ok(conversation)
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversations WHERE id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch conversation")?;

        row.map(conversation_from_row).transpose()
    }

    /// The at-most-one conversation for this thread that is PENDING or
    /// ASSIGNED.
    pub async fn active_conversation(
        &self,
        organization_id: Uuid,
        channel_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversations \
             WHERE organization_id = ? AND channel_id = ? AND contact_id = ? \
               AND status IN ('PENDING', 'ASSIGNED')",
            CONVERSATION_COLUMNS
        ))
        .bind(organization_id.to_string())
        .bind(channel_id.to_string())
        .bind(contact_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch active conversation")?;

        row.map(conversation_from_row).transpose()
    }

    /// Most recent conversation for the thread regardless of status; used to
    /// decide between reopening a COMPLETED one and creating a new one.
    pub async fn latest_conversation(
        &self,
        organization_id: Uuid,
        channel_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversations \
             WHERE organization_id = ? AND channel_id = ? AND contact_id = ? \
             ORDER BY created_at DESC LIMIT 1",
            CONVERSATION_COLUMNS
        ))
        .bind(organization_id.to_string())
        .bind(channel_id.to_string())
        .bind(contact_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch latest conversation")?;

        row.map(conversation_from_row).transpose()
    }

    pub async fn conversation_with_relations(
        &self,
        id: Uuid,
    ) -> Result<Option<ConversationWithRelations>> {
        let row = sqlx::query(&format!("{} WHERE cv.id = ?", RELATION_SELECT))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch conversation with relations")?;

        row.as_ref().map(relations_from_row).transpose()
    }

    pub async fn list_conversations(
        &self,
        organization_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationWithRelations>> {
        let mut sql = format!("{} WHERE cv.organization_id = ?", RELATION_SELECT);
        if filter.status.is_some() {
            sql.push_str(" AND cv.status = ?");
        }
        if filter.channel_id.is_some() {
            sql.push_str(" AND cv.channel_id = ?");
        }
        if filter.agent_id.is_some() {
            sql.push_str(" AND cv.assigned_agent_id = ?");
        }
        if filter.search.is_some() {
            sql.push_str(" AND (ct.display_name LIKE ? OR ct.provider_id LIKE ?)");
        }
        sql.push_str(" ORDER BY cv.last_message_at DESC, cv.created_at DESC LIMIT ? OFFSET ?");

        let limit = filter.limit.clamp(1, 100);
        let page = filter.page.max(1);

        let mut query = sqlx::query(&sql).bind(organization_id.to_string());
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(channel_id) = filter.channel_id {
            query = query.bind(channel_id.to_string());
        }
        if let Some(agent_id) = filter.agent_id {
            query = query.bind(agent_id.to_string());
        }
        if let Some(search) = &filter.search {
            let needle = format!("%{}%", search);
            query = query.bind(needle.clone()).bind(needle);
        }
        query = query.bind(limit).bind((page - 1) * limit);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to list conversations")?;

        rows.iter().map(relations_from_row).collect()
    }

    /// Conditional assignment: only a PENDING conversation can be taken, and
    /// the ACCEPTED audit row commits atomically with it. Returns false when
    /// the precondition no longer holds.
    pub async fn assign_conversation(&self, id: Uuid, agent_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations SET status = 'ASSIGNED', assigned_agent_id = ?, updated_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(agent_id.to_string())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to assign conversation")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        append_event_tx(
            &mut tx,
            id,
            ConversationEventType::Accepted,
            Some(agent_id),
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Owner-conditional release back to PENDING. `event_type` distinguishes
    /// an explicit RELEASED from an AGENT_DISCONNECTED compensation.
    pub async fn release_conversation(
        &self,
        id: Uuid,
        agent_id: Uuid,
        event_type: ConversationEventType,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations SET status = 'PENDING', assigned_agent_id = NULL, updated_at = ? \
             WHERE id = ? AND status = 'ASSIGNED' AND assigned_agent_id = ?",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to release conversation")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        append_event_tx(&mut tx, id, event_type, Some(agent_id), serde_json::json!({})).await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn complete_conversation(&self, id: Uuid, agent_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations SET status = 'COMPLETED', assigned_agent_id = NULL, updated_at = ? \
             WHERE id = ? AND status = 'ASSIGNED' AND assigned_agent_id = ?",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to complete conversation")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        append_event_tx(
            &mut tx,
            id,
            ConversationEventType::Completed,
            Some(agent_id),
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Reopen a COMPLETED conversation to PENDING. No-op (false) for any
    /// other status.
    pub async fn reopen_conversation(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations SET status = 'PENDING', assigned_agent_id = NULL, updated_at = ? \
             WHERE id = ? AND status = 'COMPLETED'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to reopen conversation")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        append_event_tx(&mut tx, id, ConversationEventType::Reopened, None, serde_json::json!({}))
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn assigned_conversations(&self, agent_id: Uuid) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversations WHERE status = 'ASSIGNED' AND assigned_agent_id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch assigned conversations")?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    /// Monotonic advance: an out-of-order webhook worker cannot move
    /// `last_message_at` backwards.
    pub async fn touch_last_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET last_message_at = ?, updated_at = ? \
             WHERE id = ? AND (last_message_at IS NULL OR last_message_at < ?)",
        )
        .bind(at)
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .context("failed to advance last_message_at")?;
        Ok(())
    }

    /// Set once; reopening a conversation does not reset it.
    pub async fn set_first_response(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET first_response_at = ? WHERE id = ? AND first_response_at IS NULL",
        )
        .bind(at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("failed to set first_response_at")?;
        Ok(())
    }

    pub async fn append_event(
        &self,
        conversation_id: Uuid,
        event_type: ConversationEventType,
        actor_id: Option<Uuid>,
        metadata: Value,
    ) -> Result<ConversationEvent> {
        let mut conn = self.pool.acquire().await?;
        append_event_tx(&mut conn, conversation_id, event_type, actor_id, metadata).await
    }

    /// Audit trail, newest first.
    pub async fn events_page(
        &self,
        conversation_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ConversationEvent>> {
        let limit = limit.clamp(1, 100);
        let page = page.max(1);

        let rows: Vec<(String, String, String, Option<String>, String, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, conversation_id, event_type, actor_id, metadata, created_at \
                 FROM conversation_events WHERE conversation_id = ? \
                 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(conversation_id.to_string())
            .bind(limit)
            .bind((page - 1) * limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch conversation events")?;

        rows.into_iter()
            .map(|(id, conversation_id, event_type, actor_id, metadata, created_at)| {
                Ok(ConversationEvent {
                    id: Uuid::parse_str(&id)?,
                    conversation_id: Uuid::parse_str(&conversation_id)?,
                    event_type: ConversationEventType::parse(&event_type)
                        .ok_or_else(|| anyhow!("bad event type: {}", event_type))?,
                    actor_id: actor_id.map(|s| Uuid::parse_str(&s)).transpose()?,
                    metadata: parse_json(metadata),
                    created_at,
                })
            })
            .collect()
    }

    pub async fn events_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationEvent>> {
        self.events_page(conversation_id, 1, 100).await
    }
}
