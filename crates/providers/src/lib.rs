//! Provider adapters: per-provider send/receive translation between the two
//! external messaging APIs and the internal normalized shapes. Both adapters
//! sit behind one trait so the webhook processor and the outbound worker are
//! provider-agnostic.

use async_trait::async_trait;
use relaydesk_core::types::{Channel, InboundItem, Provider};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod messenger;
pub mod signature;
pub mod whatsapp;

pub use messenger::MessengerAdapter;
pub use whatsapp::WhatsAppAdapter;

#[derive(Debug, Error)]
pub enum ProviderSendError {
    /// The provider API answered with an error body. Carries the provider's
    /// own code so it lands in Message.error_code.
    #[error("provider rejected send ({code}): {message}")]
    Rejected { code: String, message: String },

    /// Transport-level failure (connect, timeout, non-JSON body).
    #[error("provider transport failure: {0}")]
    Transport(String),

    /// The channel config is missing credentials or addressing.
    #[error("channel misconfigured: {0}")]
    Misconfigured(String),
}

/// Outbound content as the send worker hands it over.
#[derive(Debug, Clone)]
pub struct OutboundContent {
    pub body: Option<String>,
    pub media_ref: Option<String>,
    pub media_type: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Extract the provider-addressing id (phone_number_id / page id) from a
    /// raw webhook payload, for channel lookup. None when the payload is not
    /// shaped like this provider's events.
    fn addressing_id(&self, payload: &Value) -> Option<String>;

    /// Total normalization: every message and status callback in the payload
    /// becomes an `InboundItem`; unrecognized message kinds normalize to the
    /// Unsupported variant rather than being dropped.
    fn normalize(&self, payload: &Value) -> Vec<InboundItem>;

    /// Deliver one outbound message through the provider API and return the
    /// provider's message id.
    async fn send(
        &self,
        channel: &Channel,
        recipient: &str,
        content: &OutboundContent,
    ) -> Result<String, ProviderSendError>;
}

/// Build the adapter for a channel's provider. One shared reqwest client is
/// reused across adapters; the hard per-call deadline lives on the client.
pub fn adapter_for(provider: Provider, client: reqwest::Client) -> Arc<dyn ProviderAdapter> {
    match provider {
        Provider::WhatsApp => Arc::new(WhatsAppAdapter::new(client)),
        Provider::Messenger => Arc::new(MessengerAdapter::new(client)),
    }
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client construction cannot fail with static options")
}
