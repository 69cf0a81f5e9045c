use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{Message, MessageDirection, MessageStatus};
use uuid::Uuid;

use crate::InboxStore;

type MessageRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, agent_id, body, media_ref, \
     media_type, provider_message_id, status, error_code, error_message, created_at";

fn message_from_row(row: MessageRow) -> Result<Message> {
    let (
        id,
        conversation_id,
        direction,
        agent_id,
        body,
        media_ref,
        media_type,
        provider_message_id,
        status,
        error_code,
        error_message,
        created_at,
    ) = row;
    Ok(Message {
        id: Uuid::parse_str(&id)?,
        conversation_id: Uuid::parse_str(&conversation_id)?,
        direction: MessageDirection::parse(&direction)
            .ok_or_else(|| anyhow!("bad message direction: {}", direction))?,
        agent_id: agent_id.map(|s| Uuid::parse_str(&s)).transpose()?,
        body,
        media_ref,
        media_type,
        provider_message_id,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad message status: {}", status))?,
        error_code,
        error_message,
        created_at,
    })
}

/// Result of an inbound insert: the unique provider message id makes a
/// redelivered webhook a no-op.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Message),
    Duplicate,
}

/// Result of applying a status callback.
#[derive(Debug)]
pub enum StatusAdvance {
    Applied(Message),
    /// The callback would regress the status; it is dropped, not persisted.
    Dropped,
    NotFound,
}

impl InboxStore {
    /// Insert an inbound message (DELIVERED on arrival). A unique violation
    /// on `provider_message_id` means the provider redelivered the webhook;
    /// that is reported as `Duplicate`, not an error.
    pub async fn insert_inbound_message(
        &self,
        conversation_id: Uuid,
        provider_message_id: &str,
        body: Option<String>,
        media_ref: Option<String>,
        media_type: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            direction: MessageDirection::Inbound,
            agent_id: None,
            body,
            media_ref,
            media_type,
            provider_message_id: Some(provider_message_id.to_string()),
            status: MessageStatus::Delivered,
            error_code: None,
            error_message: None,
            created_at: received_at,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, direction, agent_id, body, media_ref,
                                  media_type, provider_message_id, status, created_at)
            VALUES (?, ?, 'INBOUND', NULL, ?, ?, ?, ?, 'DELIVERED', ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(message.body.as_deref())
        .bind(message.media_ref.as_deref())
        .bind(message.media_type.as_deref())
        .bind(provider_message_id)
        .bind(message.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(InsertOutcome::Inserted(message)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e).context("failed to insert inbound message"),
        }
    }

    /// Insert an outbound message in PENDING; the provider message id arrives
    /// later, from the send worker.
    pub async fn insert_outbound_message(
        &self,
        conversation_id: Uuid,
        agent_id: Uuid,
        body: Option<String>,
        media_ref: Option<String>,
        media_type: Option<String>,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            direction: MessageDirection::Outbound,
            agent_id: Some(agent_id),
            body,
            media_ref,
            media_type,
            provider_message_id: None,
            status: MessageStatus::Pending,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, direction, agent_id, body, media_ref,
                                  media_type, status, created_at)
            VALUES (?, ?, 'OUTBOUND', ?, ?, ?, ?, 'PENDING', ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(agent_id.to_string())
        .bind(message.body.as_deref())
        .bind(message.media_ref.as_deref())
        .bind(message.media_type.as_deref())
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert outbound message")?;

        Ok(message)
    }

    pub async fn message(&self, id: Uuid) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch message")?;

        row.map(message_from_row).transpose()
    }

    pub async fn message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM messages WHERE provider_message_id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch message by provider id")?;

        row.map(message_from_row).transpose()
    }

    /// Provider accepted the send: PENDING → SENT, adopting the provider's
    /// message id as the idempotency key for later callbacks. A FAILED row is
    /// also eligible — the send worker retries after a failed attempt — and
    /// its error fields are cleared. Status callbacks cannot do this; only
    /// the worker path leaves FAILED.
    pub async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>> {
        let updated = sqlx::query(
            "UPDATE messages SET status = 'SENT', provider_message_id = ?, \
                 error_code = NULL, error_message = NULL \
             WHERE id = ? AND status IN ('PENDING', 'FAILED')",
        )
        .bind(provider_message_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("failed to mark message sent")?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.message(id).await
    }

    /// FAILED absorbs PENDING and SENT; anything further along is left
    /// untouched.
    pub async fn mark_message_failed(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<Option<Message>> {
        let updated = sqlx::query(
            "UPDATE messages SET status = 'FAILED', error_code = ?, error_message = ? \
             WHERE id = ? AND status IN ('PENDING', 'SENT')",
        )
        .bind(error_code)
        .bind(error_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("failed to mark message failed")?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.message(id).await
    }

    /// Apply a provider status callback by provider message id. Regressions
    /// (e.g. DELIVERED after READ) are dropped; the conditional update keeps
    /// the check race-safe against a concurrent worker.
    pub async fn advance_message_status(
        &self,
        provider_message_id: &str,
        next: MessageStatus,
    ) -> Result<StatusAdvance> {
        let Some(current) = self.message_by_provider_id(provider_message_id).await? else {
            return Ok(StatusAdvance::NotFound);
        };

        if !current.status.can_advance_to(next) {
            return Ok(StatusAdvance::Dropped);
        }

        let updated = sqlx::query(
            "UPDATE messages SET status = ? WHERE provider_message_id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(provider_message_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await
        .context("failed to advance message status")?
        .rows_affected();

        if updated == 0 {
            return Ok(StatusAdvance::Dropped);
        }

        match self.message_by_provider_id(provider_message_id).await? {
            Some(message) => Ok(StatusAdvance::Applied(message)),
            None => Ok(StatusAdvance::NotFound),
        }
    }

    /// Messenger-style read receipt: advance every outbound SENT/DELIVERED
    /// message in the conversation at or before the watermark to READ.
    /// Returns the messages that actually advanced.
    pub async fn read_up_to_watermark(
        &self,
        conversation_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM messages \
             WHERE conversation_id = ? AND direction = 'OUTBOUND' \
               AND status IN ('SENT', 'DELIVERED') AND created_at <= ?",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id.to_string())
        .bind(watermark)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch messages under watermark")?;

        let mut advanced = Vec::new();
        for row in rows {
            let mut message = message_from_row(row)?;
            let updated = sqlx::query(
                "UPDATE messages SET status = 'READ' \
                 WHERE id = ? AND status IN ('SENT', 'DELIVERED')",
            )
            .bind(message.id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to advance message to READ")?
            .rows_affected();

            if updated > 0 {
                message.status = MessageStatus::Read;
                advanced.push(message);
            }
        }

        Ok(advanced)
    }

    /// Cursor pagination, newest first. The cursor is a message id; we fetch
    /// one past the limit to learn whether a further page exists.
    pub async fn messages_page(
        &self,
        conversation_id: Uuid,
        cursor: Option<Uuid>,
        limit: u32,
    ) -> Result<(Vec<Message>, Option<Uuid>)> {
        let limit = limit.clamp(1, 100);

        let anchor = match cursor {
            Some(id) => {
                let Some(message) = self.message(id).await? else {
                    return Err(anyhow!("cursor message not found"));
                };
                Some((message.created_at, message.id.to_string()))
            }
            None => None,
        };

        let rows: Vec<MessageRow> = match &anchor {
            Some((created_at, id)) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM messages \
                     WHERE conversation_id = ? AND (created_at < ? OR (created_at = ? AND id < ?)) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id.to_string())
                .bind(created_at)
                .bind(created_at)
                .bind(id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id.to_string())
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to page messages")?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        let next_cursor = if messages.len() as u32 > limit {
            messages.truncate(limit as usize);
            messages.last().map(|m| m.id)
        } else {
            None
        };

        Ok((messages, next_cursor))
    }
}
