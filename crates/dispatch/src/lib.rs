//! Conversation dispatch: the webhook processor, the conversation state
//! machine with its distributed-lock accept protocol, and the outbound send
//! pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relaydesk_core::types::Provider;
use relaydesk_providers::{MessengerAdapter, ProviderAdapter, WhatsAppAdapter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod conversations;
pub mod outbound;
pub mod processor;

pub use conversations::ConversationService;
pub use outbound::{OutboundService, OutboundWorker};
pub use processor::WebhookProcessor;

/// One ingest unit: the raw provider payload exactly as received, deferred
/// for asynchronous processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub provider: Provider,
    pub channel_id: Uuid,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
}

/// One outbound send unit, enqueued after the PENDING message row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundJob {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    pub body: Option<String>,
    pub media_ref: Option<String>,
    pub media_type: Option<String>,
}

/// The two provider adapters behind one lookup, so processors stay
/// provider-agnostic and tests can swap in doubles.
#[derive(Clone)]
pub struct AdapterSet {
    whatsapp: Arc<dyn ProviderAdapter>,
    messenger: Arc<dyn ProviderAdapter>,
}

impl AdapterSet {
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            whatsapp: Arc::new(WhatsAppAdapter::new(client.clone())),
            messenger: Arc::new(MessengerAdapter::new(client)),
        }
    }

    pub fn custom(whatsapp: Arc<dyn ProviderAdapter>, messenger: Arc<dyn ProviderAdapter>) -> Self {
        Self { whatsapp, messenger }
    }

    pub fn get(&self, provider: Provider) -> Arc<dyn ProviderAdapter> {
        match provider {
            Provider::WhatsApp => self.whatsapp.clone(),
            Provider::Messenger => self.messenger.clone(),
        }
    }
}
