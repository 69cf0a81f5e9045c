use std::sync::Arc;

use chrono::Utc;
use relaydesk_core::bus::{Event, EventBus};
use relaydesk_core::error::{InboxError, Result};
use relaydesk_core::metrics::MetricsStore;
use relaydesk_core::types::{ConversationEventType, Message, MessageStatus};
use relaydesk_core::validate::Validator;
use relaydesk_persistence::InboxStore;
use relaydesk_providers::{OutboundContent, ProviderSendError};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{AdapterSet, OutboundJob};

pub const MAX_BODY_CHARS: usize = 4096;

/// Request-side half of the send pipeline: authorize, persist the PENDING
/// row with its timestamps and audit event, and hand back the job for the
/// queue. The caller returns the PENDING message to the agent immediately.
pub struct OutboundService {
    store: InboxStore,
    bus: Arc<EventBus>,
}

impl OutboundService {
    pub fn new(store: InboxStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub async fn submit(
        &self,
        conversation_id: Uuid,
        organization_id: Uuid,
        agent_id: Uuid,
        body: Option<String>,
        media_ref: Option<String>,
        media_type: Option<String>,
    ) -> Result<(Message, OutboundJob)> {
        let mut v = Validator::new();
        v.require(
            "body",
            body.as_deref().map(|b| !b.trim().is_empty()).unwrap_or(false) || media_ref.is_some(),
            "either body or media is required",
        );
        if let Some(body) = body.as_deref() {
            v.require_max_len("body", body, MAX_BODY_CHARS);
        }
        if media_ref.is_some() {
            v.require(
                "media.type",
                matches!(
                    media_type.as_deref(),
                    Some("image" | "audio" | "video" | "document")
                ),
                "media requires a type of image, audio, video or document",
            );
        }
        v.finish()?;

        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .filter(|c| c.organization_id == organization_id)
            .ok_or_else(|| InboxError::NotFound("conversation".to_string()))?;

        // Authorization reads the row, never a cache: only the assigned
        // agent may reply.
        if conversation.assigned_agent_id != Some(agent_id) {
            return Err(InboxError::Authz(
                "conversation is not assigned to you".to_string(),
            ));
        }

        let message = self
            .store
            .insert_outbound_message(
                conversation_id,
                agent_id,
                body.clone(),
                media_ref.clone(),
                media_type.clone(),
            )
            .await?;

        let now = Utc::now();
        self.store.touch_last_message(conversation_id, now).await?;
        self.store.set_first_response(conversation_id, now).await?;
        self.store
            .append_event(
                conversation_id,
                ConversationEventType::MessageSent,
                Some(agent_id),
                json!({ "message_id": message.id }),
            )
            .await?;

        self.bus.publish(Event::MessageNew {
            message_id: message.id,
            conversation_id,
            organization_id,
        });
        self.bus
            .publish(Event::ConversationUpdated { conversation_id, organization_id });

        let job = OutboundJob {
            message_id: message.id,
            conversation_id,
            channel_id: conversation.channel_id,
            contact_id: conversation.contact_id,
            body,
            media_ref,
            media_type,
        };

        Ok((message, job))
    }
}

/// Worker-side half: load the channel and contact, dispatch through the
/// provider adapter, persist the outcome, and re-throw retryable failures so
/// the pool's backoff policy applies.
pub struct OutboundWorker {
    store: InboxStore,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsStore>,
    adapters: AdapterSet,
}

impl OutboundWorker {
    pub fn new(
        store: InboxStore,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsStore>,
        adapters: AdapterSet,
    ) -> Self {
        Self { store, bus, metrics, adapters }
    }

    pub async fn deliver(&self, job: OutboundJob) -> Result<()> {
        let message = self
            .store
            .message(job.message_id)
            .await?
            .ok_or_else(|| InboxError::validation("messageId", "message no longer exists"))?;

        // PENDING on the first attempt, FAILED on a retry after a recorded
        // failure; anything else means a previous attempt already landed.
        if !matches!(message.status, MessageStatus::Pending | MessageStatus::Failed) {
            return Ok(());
        }

        let channel = self
            .store
            .channel(job.channel_id)
            .await?
            .ok_or_else(|| InboxError::validation("channelId", "channel no longer exists"))?;
        let contact = self
            .store
            .contact(job.contact_id)
            .await?
            .ok_or_else(|| InboxError::validation("contactId", "contact no longer exists"))?;

        let content = OutboundContent {
            body: job.body.clone(),
            media_ref: job.media_ref.clone(),
            media_type: job.media_type.clone(),
        };

        let adapter = self.adapters.get(channel.provider);
        match adapter.send(&channel, &contact.provider_id, &content).await {
            Ok(provider_message_id) => {
                let Some(sent) =
                    self.store.mark_message_sent(job.message_id, &provider_message_id).await?
                else {
                    // A concurrent callback advanced the row first.
                    return Ok(());
                };

                self.metrics.inc_messages_out();
                info!(
                    message_id = %job.message_id,
                    provider_message_id = %provider_message_id,
                    "outbound message sent"
                );
                self.bus.publish(Event::MessageUpdated {
                    message_id: sent.id,
                    conversation_id: sent.conversation_id,
                    status: MessageStatus::Sent,
                });
                self.metrics.inc_events_published();
                Ok(())
            }
            Err(send_error) => {
                let (code, description) = match &send_error {
                    ProviderSendError::Rejected { code, message } => {
                        (code.clone(), message.clone())
                    }
                    ProviderSendError::Transport(message) => {
                        ("transport".to_string(), message.clone())
                    }
                    ProviderSendError::Misconfigured(message) => {
                        ("config".to_string(), message.clone())
                    }
                };

                warn!(message_id = %job.message_id, error = %send_error, "outbound send failed");

                // First failure records FAILED and its audit row; later
                // attempts find the row already FAILED and skip both.
                if let Some(failed) = self
                    .store
                    .mark_message_failed(job.message_id, &code, &description)
                    .await?
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

                Err(match send_error {
                    ProviderSendError::Rejected { code, message } => {
                        InboxError::Provider { code, message }
                    }
                    ProviderSendError::Transport(message) => InboxError::Transient(message),
                    ProviderSendError::Misconfigured(message) => {
                        InboxError::validation("channel", &message)
                    }
                })
            }
        }
    }
}
