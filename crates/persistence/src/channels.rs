use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use relaydesk_core::types::{Channel, ChannelStatus, Provider};
use serde_json::Value;
use uuid::Uuid;

use crate::{parse_json, InboxStore};

type ChannelRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
);

const CHANNEL_COLUMNS: &str =
    "id, organization_id, provider, config, webhook_secret, app_secret, status, created_at";

fn channel_from_row(row: ChannelRow) -> Result<Channel> {
    let (id, organization_id, provider, config, webhook_secret, app_secret, status, created_at) =
        row;
    Ok(Channel {
        id: Uuid::parse_str(&id)?,
        organization_id: Uuid::parse_str(&organization_id)?,
        provider: Provider::parse(&provider)
            .ok_or_else(|| anyhow!("bad channel provider: {}", provider))?,
        config: parse_json(config),
        webhook_secret,
        app_secret,
        status: ChannelStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad channel status: {}", status))?,
        created_at,
    })
}

impl InboxStore {
    pub async fn create_channel(
        &self,
        organization_id: Uuid,
        provider: Provider,
        config: Value,
        webhook_secret: &str,
        app_secret: Option<&str>,
    ) -> Result<Channel> {
        let channel = Channel {
            id: Uuid::new_v4(),
            organization_id,
            provider,
            config,
            webhook_secret: webhook_secret.to_string(),
            app_secret: app_secret.map(|s| s.to_string()),
            status: ChannelStatus::Active,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO channels (id, organization_id, provider, config, webhook_secret, app_secret, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel.id.to_string())
        .bind(channel.organization_id.to_string())
        .bind(channel.provider.as_str())
        .bind(channel.config.to_string())
        .bind(&channel.webhook_secret)
        .bind(channel.app_secret.as_deref())
        .bind(channel.status.as_str())
        .bind(channel.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert channel")?;

        Ok(channel)
    }

    pub async fn channel(&self, id: Uuid) -> Result<Option<Channel>> {
        let row: Option<ChannelRow> = sqlx::query_as(&format!(
            "SELECT {} FROM channels WHERE id = ?",
            CHANNEL_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch channel")?;

        row.map(channel_from_row).transpose()
    }

    /// Resolve the channel an inbound webhook addresses. The addressing id
    /// lives inside the provider-specific config blob.
    pub async fn channel_by_addressing(
        &self,
        provider: Provider,
        addressing_id: &str,
    ) -> Result<Option<Channel>> {
        let key = match provider {
            Provider::WhatsApp => "phone_number_id",
            Provider::Messenger => "page_id",
        };

        let row: Option<ChannelRow> = sqlx::query_as(&format!(
            "SELECT {} FROM channels WHERE provider = ? AND json_extract(config, '$.' || ?) = ?",
            CHANNEL_COLUMNS
        ))
        .bind(provider.as_str())
        .bind(key)
        .bind(addressing_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve channel by addressing id")?;

        row.map(channel_from_row).transpose()
    }

    pub async fn set_channel_status(&self, id: Uuid, status: ChannelStatus) -> Result<()> {
        sqlx::query("UPDATE channels SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to update channel status")?;
        Ok(())
    }
}
