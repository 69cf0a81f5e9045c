use std::sync::Arc;

use chrono::{DateTime, Utc};
use relaydesk_core::bus::{Event, EventBus};
use relaydesk_core::error::{InboxError, Result};
use relaydesk_core::metrics::MetricsStore;
use relaydesk_core::types::{
    Channel, ConversationEventType, ConversationStatus, InboundItem, MessageStatus,
    NormalizedMessage, StatusKind, StatusUpdate,
};
use relaydesk_persistence::{InboxStore, InsertOutcome, StatusAdvance};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{AdapterSet, WebhookJob};

/// Consumes ingest jobs: contact upsert, conversation create/reopen, inbound
/// message insert with provider-id dedup, status callback application, and
/// event fan-out.
pub struct WebhookProcessor {
    store: InboxStore,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsStore>,
    adapters: AdapterSet,
}

impl WebhookProcessor {
    pub fn new(
        store: InboxStore,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsStore>,
        adapters: AdapterSet,
    ) -> Self {
        Self { store, bus, metrics, adapters }
    }

    pub async fn process(&self, job: WebhookJob) -> Result<()> {
        let channel = self
            .store
            .channel(job.channel_id)
            .await?
            .ok_or_else(|| InboxError::validation("channelId", "channel no longer exists"))?;

        let adapter = self.adapters.get(channel.provider);
        for item in adapter.normalize(&job.raw_payload) {
            match item {
                InboundItem::Message(message) => {
                    self.handle_inbound(&channel, message, job.received_at).await?;
                }
                InboundItem::Status(update) => {
                    self.handle_status(&channel, update).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_inbound(
        &self,
        channel: &Channel,
        inbound: NormalizedMessage,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let contact = self
            .store
            .upsert_contact(
                channel.organization_id,
                channel.provider,
                &inbound.sender_id,
                inbound.sender_name.as_deref(),
            )
            .await?;

        let (conversation, created) = self.find_or_open_conversation(channel, contact.id).await?;

        let occurred_at = inbound.timestamp.unwrap_or(received_at);
        let (body, media_ref, media_type) = inbound.content.into_parts();

        let outcome = self
            .store
            .insert_inbound_message(
                conversation.id,
                &inbound.provider_message_id,
                body,
                media_ref,
                media_type,
                occurred_at,
            )
            .await?;

        let message = match outcome {
            InsertOutcome::Duplicate => {
                // The provider redelivered the webhook; everything below
                // already happened once.
                debug!(provider_message_id = %inbound.provider_message_id, "duplicate inbound delivery");
                return Ok(());
            }
            InsertOutcome::Inserted(message) => message,
        };

        self.store.touch_last_message(conversation.id, occurred_at).await?;
        self.store
            .append_event(
                conversation.id,
                ConversationEventType::MessageReceived,
                None,
                json!({ "message_id": message.id }),
            )
            .await?;

        self.metrics.inc_messages_in();
        info!(
            conversation_id = %conversation.id,
            provider_message_id = %inbound.provider_message_id,
            "inbound message stored"
        );

        self.bus.publish(Event::MessageNew {
            message_id: message.id,
            conversation_id: conversation.id,
            organization_id: channel.organization_id,
        });
        if created {
            self.bus.publish(Event::ConversationNew {
                conversation_id: conversation.id,
                organization_id: channel.organization_id,
            });
        }
        self.bus.publish(Event::ConversationUpdated {
            conversation_id: conversation.id,
            organization_id: channel.organization_id,
        });
        self.metrics.inc_events_published();

        Ok(())
    }

    /// The unique active conversation for the thread, or a reopened
    /// COMPLETED one, or a fresh PENDING one. Reopening appends REOPENED
    /// before the caller appends MESSAGE_RECEIVED.
    async fn find_or_open_conversation(
        &self,
        channel: &Channel,
        contact_id: uuid::Uuid,
    ) -> Result<(relaydesk_core::types::Conversation, bool)> {
        if let Some(active) = self
            .store
            .active_conversation(channel.organization_id, channel.id, contact_id)
            .await?
        {
            return Ok((active, false));
        }

        if let Some(latest) = self
            .store
            .latest_conversation(channel.organization_id, channel.id, contact_id)
            .await?
        {
            if latest.status == ConversationStatus::Completed
                && self.store.reopen_conversation(latest.id).await?
            {
                info!(conversation_id = %latest.id, "conversation reopened by inbound message");
                let reopened = self
                    .store
                    .conversation(latest.id)
                    .await?
                    .ok_or_else(|| InboxError::NotFound("conversation".to_string()))?;
                return Ok((reopened, false));
            }
        }

        let conversation = self
            .store
            .create_conversation(channel.organization_id, channel.id, contact_id)
            .await?;
        Ok((conversation, true))
    }

    async fn handle_status(&self, channel: &Channel, update: StatusUpdate) -> Result<()> {
        match update.kind {
            StatusKind::Sent => {
                // Our own send worker already recorded SENT; a late callback
                // can only confirm it.
                if let Some(pmid) = &update.provider_message_id {
                    self.advance(pmid, MessageStatus::Sent, None).await?;
                }
                Ok(())
            }
            StatusKind::Delivered => {
                if let Some(pmid) = &update.provider_message_id {
                    self.advance(pmid, MessageStatus::Delivered, Some(ConversationEventType::MessageDelivered))
                        .await?;
                }
                Ok(())
            }
            StatusKind::Read => {
                if let Some(pmid) = &update.provider_message_id {
                    self.advance(pmid, MessageStatus::Read, Some(ConversationEventType::MessageRead))
                        .await?;
                }
                Ok(())
            }
            StatusKind::Failed { code, message } => {
                let Some(pmid) = &update.provider_message_id else {
                    return Ok(());
                };
                let Some(row) = self.store.message_by_provider_id(pmid).await? else {
                    warn!(provider_message_id = %pmid, "failure callback for unknown message");
                    return Ok(());
                };
                if let Some(failed) =
                    self.store.mark_message_failed(row.id, &code, &message).await?
                {
                    self.store
                        .append_event(
                            failed.conversation_id,
                            ConversationEventType::MessageFailed,
                            None,
                            json!({ "message_id": failed.id, "error_code": code }),
                        )
                        .await?;
                    self.bus.publish(Event::MessageUpdated {
                        message_id: failed.id,
                        conversation_id: failed.conversation_id,
                        status: MessageStatus::Failed,
                    });
                    self.metrics.inc_events_published();
                }
                Ok(())
            }
            StatusKind::ReadWatermark { watermark } => {
                self.apply_read_watermark(channel, update.recipient_id.as_deref(), watermark)
                    .await
            }
        }
    }

    async fn advance(
        &self,
        provider_message_id: &str,
        next: MessageStatus,
        event_type: Option<ConversationEventType>,
    ) -> Result<()> {
        match self.store.advance_message_status(provider_message_id, next).await? {
            StatusAdvance::Applied(message) => {
                if let Some(event_type) = event_type {
                    self.store
                        .append_event(
                            message.conversation_id,
                            event_type,
                            None,
                            json!({ "message_id": message.id }),
                        )
                        .await?;
                }
                self.bus.publish(Event::MessageUpdated {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    status: next,
                });
                self.metrics.inc_events_published();
            }
            StatusAdvance::Dropped => {
                debug!(provider_message_id, next = next.as_str(), "dropped regressive status callback");
            }
            StatusAdvance::NotFound => {
                warn!(provider_message_id, "status callback for unknown message");
            }
        }
        Ok(())
    }

    /// Messenger-style reads are watermark-based: every outbound message in
    /// the thread at or before the watermark is now read.
    async fn apply_read_watermark(
        &self,
        channel: &Channel,
        reader_provider_id: Option<&str>,
        watermark: DateTime<Utc>,
    ) -> Result<()> {
        let Some(provider_id) = reader_provider_id else {
            return Ok(());
        };
        let Some(contact) = self
            .store
            .contact_by_provider_id(channel.organization_id, channel.provider, provider_id)
            .await?
        else {
            debug!(provider_id, "read watermark for unknown contact");
            return Ok(());
        };

        let Some(conversation) = self
            .store
            .latest_conversation(channel.organization_id, channel.id, contact.id)
            .await?
        else {
            return Ok(());
        };

        let advanced = self.store.read_up_to_watermark(conversation.id, watermark).await?;
        for message in advanced {
            self.store
                .append_event(
                    message.conversation_id,
                    ConversationEventType::MessageRead,
                    None,
                    json!({ "message_id": message.id }),
                )
                .await?;
            self.bus.publish(Event::MessageUpdated {
                message_id: message.id,
                conversation_id: message.conversation_id,
                status: MessageStatus::Read,
            });
            self.metrics.inc_events_published();
        }

        Ok(())
    }
}
