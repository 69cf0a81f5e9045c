use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relaydesk_core::bus::{Event, EventBus, EventEnvelope};
use relaydesk_core::metrics::MetricsStore;
use relaydesk_core::types::{Channel, InboundItem, Organization, Provider};
use relaydesk_coordination::MemoryCoordination;
use relaydesk_persistence::InboxStore;
use relaydesk_providers::{OutboundContent, ProviderAdapter, ProviderSendError};
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub struct TestCtx {
    pub store: InboxStore,
    pub bus: Arc<EventBus>,
    pub coordination: Arc<MemoryCoordination>,
    pub metrics: Arc<MetricsStore>,
    pub org: Organization,
    pub channel: Channel,
}

pub async fn ctx() -> TestCtx {
    ctx_with_provider(Provider::WhatsApp).await
}

pub async fn ctx_with_provider(provider: Provider) -> TestCtx {
    let store = InboxStore::connect("sqlite::memory:").await.unwrap();
    let org = store.create_organization("acme", "Acme Corp").await.unwrap();
    let config = match provider {
        Provider::WhatsApp => json!({ "phone_number_id": "101", "access_token": "tok" }),
        Provider::Messenger => json!({ "page_id": "page-77", "access_token": "tok" }),
    };
    let channel = store
        .create_channel(org.id, provider, config, "verify-token", Some("app-secret"))
        .await
        .unwrap();

    TestCtx {
        store,
        bus: Arc::new(EventBus::new(256)),
        coordination: Arc::new(MemoryCoordination::new()),
        metrics: MetricsStore::new(),
        org,
        channel,
    }
}

/// Drain whatever is currently buffered on a bus subscription.
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

pub fn event_names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

#[derive(Clone)]
pub enum ScriptedSend {
    Accept(String),
    Reject { code: String, message: String },
    Timeout(String),
}

/// Provider double for the send path: pops one scripted outcome per send and
/// records what was dispatched.
pub struct ScriptedAdapter {
    provider: Provider,
    script: Mutex<VecDeque<ScriptedSend>>,
    pub sent: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedAdapter {
    pub fn new(provider: Provider, script: Vec<ScriptedSend>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn addressing_id(&self, _payload: &Value) -> Option<String> {
        None
    }

    fn normalize(&self, _payload: &Value) -> Vec<InboundItem> {
        Vec::new()
    }

    async fn send(
        &self,
        _channel: &Channel,
        recipient: &str,
        content: &OutboundContent,
    ) -> Result<String, ProviderSendError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), content.body.clone()));

        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedSend::Accept("pmid.default".to_string()));

        match next {
            ScriptedSend::Accept(pmid) => Ok(pmid),
            ScriptedSend::Reject { code, message } => {
                Err(ProviderSendError::Rejected { code, message })
            }
            ScriptedSend::Timeout(message) => Err(ProviderSendError::Transport(message)),
        }
    }
}
