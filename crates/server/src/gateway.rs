use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use relaydesk_core::bus::EventBus;
use relaydesk_core::config::ProviderDefaults;
use relaydesk_core::error::InboxError;
use relaydesk_core::metrics::{MetricsSnapshot, MetricsStore};
use relaydesk_core::types::{
    Channel, Conversation, ConversationEventType, ConversationStatus, ConversationWithRelations,
    Message, Provider,
};
use relaydesk_core::validate::Validator;
use relaydesk_coordination::CoordinationStore;
use relaydesk_dispatch::{
    AdapterSet, ConversationService, OutboundJob, OutboundService, WebhookJob,
};
use relaydesk_persistence::{ConversationFilter, InboxStore};
use relaydesk_queue::JobQueue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{authenticate, AuthContext};
use crate::sockets;

#[derive(Clone)]
pub struct AppState {
    pub store: InboxStore,
    pub bus: Arc<EventBus>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub metrics: Arc<MetricsStore>,
    pub adapters: AdapterSet,
    pub conversations: Arc<ConversationService>,
    pub outbound: Arc<OutboundService>,
    pub ingest_queue: JobQueue<WebhookJob>,
    pub outbound_queue: JobQueue<OutboundJob>,
    pub auth_secret: String,
    pub provider_defaults: ProviderDefaults,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/monitor/metrics", get(get_metrics))
        .route("/api/webhooks/:provider/:channel_id", get(webhook_verify))
        .route("/api/webhooks/:provider/:channel_id", post(webhook_receive))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/accept", post(accept_conversation))
        .route("/api/conversations/:id/release", post(release_conversation))
        .route("/api/conversations/:id/complete", post(complete_conversation))
        .route("/api/conversations/:id/events", get(list_events))
        .route("/api/conversations/:id/messages", get(list_messages))
        .route("/api/conversations/:id/messages", post(send_message))
        .route("/api/ws", get(sockets::ws_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, InboxError> {
    authenticate(&state.auth_secret, &headers)?;
    Ok(Json(state.metrics.snapshot()))
}

#[derive(Deserialize)]
struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

fn parse_provider(raw: &str) -> Result<Provider, InboxError> {
    Provider::parse(raw)
        .ok_or_else(|| InboxError::validation("provider", "unknown provider"))
}

/// GET verify handshake: echo the challenge when the verify token matches
/// the channel's webhook secret.
async fn webhook_verify(
    State(state): State<AppState>,
    Path((provider, channel_id)): Path<(String, Uuid)>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, InboxError> {
    let provider = parse_provider(&provider)?;
    let channel = state
        .store
        .channel(channel_id)
        .await?
        .filter(|c| c.provider == provider)
        .ok_or_else(|| InboxError::validation("channelId", "unknown channel"))?;

    if query.mode.as_deref() != Some("subscribe") {
        return Err(InboxError::validation("hub.mode", "expected subscribe"));
    }
    let provided = query.verify_token.as_deref().unwrap_or_default();
    if provided.is_empty() || provided != channel.webhook_secret {
        return Err(InboxError::Authn("verify token mismatch".to_string()));
    }

    Ok(query.challenge.unwrap_or_default())
}

fn webhook_secret<'a>(
    channel: &'a Channel,
    defaults: &'a ProviderDefaults,
) -> Option<&'a str> {
    let configured = channel.app_secret.as_deref().filter(|s| !s.is_empty());
    let fallback = match channel.provider {
        Provider::WhatsApp => defaults.whatsapp_secret.as_deref(),
        Provider::Messenger => defaults.messenger_secret.as_deref(),
    };
    configured.or(fallback.filter(|s| !s.is_empty()))
}

/// POST event delivery. Signature is checked over the exact raw bytes before
/// anything touches persistence; after acceptance the provider always gets
/// 200, whatever happens downstream.
async fn webhook_receive(
    State(state): State<AppState>,
    Path((provider, channel_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, InboxError> {
    let provider = parse_provider(&provider)?;
    let channel = state
        .store
        .channel(channel_id)
        .await?
        .filter(|c| c.provider == provider)
        .ok_or_else(|| InboxError::validation("channelId", "unknown channel"))?;

    if let Some(secret) = webhook_secret(&channel, &state.provider_defaults) {
        let signature = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok());
        if !relaydesk_providers::signature::verify_signature(signature, &body, secret) {
            return Err(InboxError::Authn("signature mismatch".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| InboxError::validation("body", "payload is not valid JSON"))?;

    state.metrics.inc_webhooks_received();

    // Route by the payload's own addressing id. A payload addressed to a
    // number or page we do not know is dropped with a 200 so the provider
    // does not retry it at us forever.
    let adapter = state.adapters.get(provider);
    let target = match adapter.addressing_id(&payload) {
        Some(addressing) if Some(addressing.as_str()) == channel.addressing_id() => channel,
        Some(addressing) => {
            match state.store.channel_by_addressing(provider, &addressing).await? {
                Some(other) => other,
                None => {
                    info!(addressing_id = %addressing, "dropping webhook for unknown channel");
                    return Ok(Json(json!({ "status": "ignored" })));
                }
            }
        }
        None => {
            info!(channel_id = %channel.id, "dropping webhook without addressing id");
            return Ok(Json(json!({ "status": "ignored" })));
        }
    };

    let job = WebhookJob {
        provider,
        channel_id: target.id,
        raw_payload: payload,
        received_at: Utc::now(),
    };
    if let Err(e) = state.ingest_queue.enqueue(job) {
        // Still 200: our fault, never the provider's cue to retry.
        warn!(error = %e, "ingest queue full, webhook dropped");
    }

    Ok(Json(json!({ "status": "accepted" })))
}

fn default_page() -> u32 {
    1
}

fn default_list_limit() -> u32 {
    20
}

fn default_messages_limit() -> u32 {
    50
}

#[derive(Deserialize)]
struct ConversationListQuery {
    status: Option<String>,
    #[serde(rename = "channelId")]
    channel_id: Option<Uuid>,
    #[serde(rename = "agentId")]
    agent_id: Option<Uuid>,
    search: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_list_limit")]
    limit: u32,
}

#[derive(Serialize)]
struct PageResponse<T> {
    data: Vec<T>,
    page: u32,
    limit: u32,
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConversationListQuery>,
) -> Result<Json<PageResponse<ConversationWithRelations>>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;

    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let mut v = Validator::new();
            v.require_one_of("status", raw, &["PENDING", "ASSIGNED", "COMPLETED"]);
            v.finish()?;
            ConversationStatus::parse(raw)
        }
        None => None,
    };

    let filter = ConversationFilter {
        status,
        channel_id: query.channel_id,
        agent_id: query.agent_id,
        search: query.search.filter(|s| !s.trim().is_empty()),
        page: query.page,
        limit: query.limit,
    };

    let data = state.store.list_conversations(auth.organization_id, &filter).await?;
    Ok(Json(PageResponse { data, page: filter.page.max(1), limit: filter.limit.clamp(1, 100) }))
}

async fn load_scoped_conversation(
    state: &AppState,
    auth: &AuthContext,
    id: Uuid,
) -> Result<ConversationWithRelations, InboxError> {
    state
        .store
        .conversation_with_relations(id)
        .await?
        .filter(|c| c.conversation.organization_id == auth.organization_id)
        .ok_or_else(|| InboxError::NotFound("conversation".to_string()))
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationWithRelations>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    Ok(Json(load_scoped_conversation(&state, &auth, id).await?))
}

async fn accept_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    let conversation = state
        .conversations
        .accept(id, auth.organization_id, auth.user_id)
        .await?;
    Ok(Json(conversation))
}

async fn release_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    let conversation = state
        .conversations
        .release(id, auth.organization_id, auth.user_id)
        .await?;
    Ok(Json(conversation))
}

async fn complete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    let conversation = state
        .conversations
        .complete(id, auth.organization_id, auth.user_id)
        .await?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_list_limit")]
    limit: u32,
}

async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    load_scoped_conversation(&state, &auth, id).await?;

    let events = state.store.events_page(id, query.page, query.limit).await?;
    Ok(Json(json!({ "data": events, "page": query.page.max(1), "limit": query.limit })))
}

#[derive(Deserialize)]
struct MessagesQuery {
    cursor: Option<Uuid>,
    #[serde(default = "default_messages_limit")]
    limit: u32,
}

#[derive(Serialize)]
struct MessagesResponse {
    data: Vec<Message>,
    #[serde(rename = "nextCursor")]
    next_cursor: Option<Uuid>,
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;
    load_scoped_conversation(&state, &auth, id).await?;

    let (data, next_cursor) = state.store.messages_page(id, query.cursor, query.limit).await?;
    Ok(Json(MessagesResponse { data, next_cursor }))
}

#[derive(Deserialize)]
struct MediaInput {
    url: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    body: Option<String>,
    media: Option<MediaInput>,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), InboxError> {
    let auth = authenticate(&state.auth_secret, &headers)?;

    let (media_ref, media_type) = match request.media {
        Some(media) => (Some(media.url), Some(media.kind)),
        None => (None, None),
    };

    let (message, job) = state
        .outbound
        .submit(id, auth.organization_id, auth.user_id, request.body, media_ref, media_type)
        .await?;

    if let Err(e) = state.outbound_queue.enqueue(job) {
        warn!(message_id = %message.id, error = %e, "outbound queue full");
        if let Some(failed) = state
            .store
            .mark_message_failed(message.id, "queue_full", "outbound queue is full")
            .await?
        {
            state
                .store
                .append_event(
                    failed.conversation_id,
                    ConversationEventType::MessageFailed,
                    None,
                    json!({ "message_id": failed.id, "error_code": "queue_full" }),
                )
                .await?;
        }
        return Err(InboxError::Transient("outbound queue is full".to_string()));
    }

    Ok((StatusCode::CREATED, Json(message)))
}
