use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::stream::StreamExt;
use futures::SinkExt;
use relaydesk_core::bus::{conv_room, org_room, user_room, Event};
use relaydesk_core::types::AgentPresence;
use relaydesk_coordination::session_key;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{verify_token, AuthContext};
use crate::gateway::AppState;

/// TTL on the coordination-store session blob; refreshed on client activity.
const SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Commands a connected console may send. Wire names mirror the server→client
/// event convention.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
enum ClientCommand {
    #[serde(rename = "join:conversation")]
    JoinConversation {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "leave:conversation")]
    LeaveConversation {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "set:status")]
    SetStatus { status: String },
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Browsers cannot set headers on a websocket handshake, so the token may
    // arrive as a query parameter instead.
    let token = query.token.or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.to_string())
    });
    let auth = token.and_then(|t| verify_token(&state.auth_secret, &t));

    ws.on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, auth: Option<AuthContext>) {
    let Some(auth) = auth else {
        let frame = json!({ "event": "error", "data": { "message": "unauthorized" } });
        let _ = socket.send(WsMessage::Text(frame.to_string())).await;
        return;
    };

    let connection_id = Uuid::new_v4().to_string();
    let mut rooms: HashSet<String> = HashSet::new();
    rooms.insert(org_room(auth.organization_id));
    rooms.insert(user_room(auth.user_id));

    if let Err(e) = state.store.open_agent_session(auth.user_id, &connection_id).await {
        warn!(error = %e, "failed to persist agent session");
    }
    let blob = json!({
        "userId": auth.user_id,
        "organizationId": auth.organization_id,
        "connectionId": connection_id,
    })
    .to_string();
    if let Err(e) = state
        .coordination
        .put_session(&session_key(&auth.user_id.to_string()), &blob, SESSION_TTL)
        .await
    {
        warn!(error = %e, "failed to store session blob");
    }

    state.bus.publish(Event::AgentStatusChanged {
        agent_id: auth.user_id,
        organization_id: auth.organization_id,
        status: AgentPresence::Online,
    });

    info!(agent_id = %auth.user_id, connection_id = %connection_id, "agent socket connected");

    let mut bus_rx = state.bus.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            envelope = bus_rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        let event_rooms = envelope.event.rooms();
                        if !event_rooms.iter().any(|room| rooms.contains(room)) {
                            continue;
                        }
                        let frame = match serde_json::to_string(&envelope.event) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize event frame");
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Client consoles reconcile by reloading; tell them.
                        let frame = json!({ "event": "lagged", "data": { "skipped": skipped } });
                        if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                let WsMessage::Text(text) = message else {
                    continue;
                };
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(_) => {
                        let frame = json!({ "event": "error", "data": { "message": "unrecognized command" } });
                        if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                // Any client activity keeps the session blob alive.
                let _ = state
                    .coordination
                    .put_session(&session_key(&auth.user_id.to_string()), &blob, SESSION_TTL)
                    .await;

                if let Some(error) =
                    handle_command(&state, &auth, &connection_id, &mut rooms, command).await
                {
                    let frame = json!({ "event": "error", "data": { "message": error } });
                    if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Disconnect compensation: drop the session, release held conversations,
    // broadcast OFFLINE. All best-effort; failures are logged, not raised.
    if let Err(e) = state
        .coordination
        .drop_session(&session_key(&auth.user_id.to_string()))
        .await
    {
        warn!(error = %e, "failed to drop session blob");
    }
    if let Err(e) = state.store.close_agent_session(&connection_id).await {
        warn!(error = %e, "failed to close agent session");
    }
    match state.conversations.release_by_agent(auth.user_id).await {
        Ok(released) if !released.is_empty() => {
            debug!(agent_id = %auth.user_id, count = released.len(), "released on disconnect");
        }
        Ok(_) => {}
        Err(e) => warn!(agent_id = %auth.user_id, error = %e, "release on disconnect failed"),
    }
    state.bus.publish(Event::AgentStatusChanged {
        agent_id: auth.user_id,
        organization_id: auth.organization_id,
        status: AgentPresence::Offline,
    });

    info!(agent_id = %auth.user_id, connection_id = %connection_id, "agent socket disconnected");
}

/// Returns a client-facing error message, or None when the command was
/// applied.
async fn handle_command(
    state: &AppState,
    auth: &AuthContext,
    connection_id: &str,
    rooms: &mut HashSet<String>,
    command: ClientCommand,
) -> Option<String> {
    match command {
        ClientCommand::JoinConversation { conversation_id } => {
            // Room membership is an authorization decision; it reads the row.
            match state.store.conversation(conversation_id).await {
                Ok(Some(c)) if c.organization_id == auth.organization_id => {
                    rooms.insert(conv_room(conversation_id));
                    None
                }
                Ok(_) => Some("conversation not found".to_string()),
                Err(e) => {
                    warn!(error = %e, "join:conversation lookup failed");
                    Some("conversation lookup failed".to_string())
                }
            }
        }
        ClientCommand::LeaveConversation { conversation_id } => {
            rooms.remove(&conv_room(conversation_id));
            None
        }
        ClientCommand::TypingStart { conversation_id } => {
            state.bus.publish(Event::AgentTyping {
                conversation_id,
                agent_id: auth.user_id,
                typing: true,
            });
            None
        }
        ClientCommand::TypingStop { conversation_id } => {
            state.bus.publish(Event::AgentTyping {
                conversation_id,
                agent_id: auth.user_id,
                typing: false,
            });
            None
        }
        ClientCommand::SetStatus { status } => {
            let Some(presence) = AgentPresence::parse(&status) else {
                return Some("status must be ONLINE, AWAY or OFFLINE".to_string());
            };
            if let Err(e) = state.store.set_session_status(connection_id, presence).await {
                warn!(error = %e, "set:status persistence failed");
            }
            state.bus.publish(Event::AgentStatusChanged {
                agent_id: auth.user_id,
                organization_id: auth.organization_id,
                status: presence,
            });
            None
        }
    }
}
