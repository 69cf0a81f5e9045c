use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaydesk_core::types::{
    Channel, InboundItem, MessageContent, NormalizedMessage, Provider, StatusKind, StatusUpdate,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::{OutboundContent, ProviderAdapter, ProviderSendError};

/// WhatsApp-style adapter: Graph-shaped webhook payloads
/// (`entry[].changes[].value`) and sends through
/// `{api_base}/{phone_number_id}/messages`.
pub struct WhatsAppAdapter {
    client: reqwest::Client,
}

impl WhatsAppAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn normalize_message(msg: &Value, sender_name: Option<&str>) -> Option<NormalizedMessage> {
        let id = msg.get("id").and_then(|v| v.as_str())?;
        let from = msg.get("from").and_then(|v| v.as_str())?;
        let kind = msg.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");

        let content = match kind {
            "text" => MessageContent::Text {
                body: msg
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "image" => MessageContent::Image {
                media_ref: media_id(msg, "image")?,
                caption: caption(msg, "image"),
            },
            "audio" => MessageContent::Audio { media_ref: media_id(msg, "audio")? },
            "video" => MessageContent::Video {
                media_ref: media_id(msg, "video")?,
                caption: caption(msg, "video"),
            },
            "document" => MessageContent::Document {
                media_ref: media_id(msg, "document")?,
                filename: msg
                    .get("document")
                    .and_then(|d| d.get("filename"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            },
            "location" => {
                let location = msg.get("location")?;
                MessageContent::Location {
                    latitude: location.get("latitude").and_then(|v| v.as_f64())?,
                    longitude: location.get("longitude").and_then(|v| v.as_f64())?,
                    name: location
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                }
            }
            other => MessageContent::Unsupported { kind: other.to_string() },
        };

        let timestamp = msg
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Some(NormalizedMessage {
            provider_message_id: id.to_string(),
            sender_id: from.to_string(),
            sender_name: sender_name.map(|s| s.to_string()),
            content,
            timestamp,
        })
    }

    fn normalize_status(status: &Value) -> Option<StatusUpdate> {
        let id = status.get("id").and_then(|v| v.as_str())?;
        let recipient_id = status
            .get("recipient_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let kind = match status.get("status").and_then(|v| v.as_str())? {
            "sent" => StatusKind::Sent,
            "delivered" => StatusKind::Delivered,
            "read" => StatusKind::Read,
            "failed" => {
                let error = status
                    .get("errors")
                    .and_then(|v| v.as_array())
                    .and_then(|errors| errors.first());
                StatusKind::Failed {
                    code: error
                        .and_then(|e| e.get("code"))
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    message: error
                        .and_then(|e| e.get("title"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("send failed")
                        .to_string(),
                }
            }
            other => {
                warn!(status = other, "ignoring unknown whatsapp status");
                return None;
            }
        };

        Some(StatusUpdate { provider_message_id: Some(id.to_string()), recipient_id, kind })
    }

    fn build_send_body(to: &str, content: &OutboundContent) -> Value {
        match (&content.media_ref, content.media_type.as_deref()) {
            (Some(link), Some(kind @ ("image" | "audio" | "video" | "document"))) => {
                let mut media = json!({ "link": link });
                if let (Some(body), "image" | "video" | "document") = (&content.body, kind) {
                    media["caption"] = json!(body);
                }
                let mut body = json!({
                    "messaging_product": "whatsapp",
                    "to": to,
                    "type": kind,
                });
                body[kind] = media;
                body
            }
            _ => json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": { "body": content.body.clone().unwrap_or_default() },
            }),
        }
    }
}

fn media_id(msg: &Value, key: &str) -> Option<String> {
    msg.get(key)
        .and_then(|m| m.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn caption(msg: &Value, key: &str) -> Option<String> {
    msg.get(key)
        .and_then(|m| m.get("caption"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl ProviderAdapter for WhatsAppAdapter {
    fn provider(&self) -> Provider {
        Provider::WhatsApp
    }

    fn addressing_id(&self, payload: &Value) -> Option<String> {
        payload
            .get("entry")?
            .as_array()?
            .iter()
            .flat_map(|entry| {
                entry
                    .get("changes")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default()
            })
            .find_map(|change| {
                change
                    .get("value")
                    .and_then(|v| v.get("metadata"))
                    .and_then(|m| m.get("phone_number_id"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
    }

    fn normalize(&self, payload: &Value) -> Vec<InboundItem> {
        let mut items = Vec::new();

        let entries = payload
            .get("entry")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let changes = entry
                .get("changes")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for change in changes {
                let value = change.get("value").cloned().unwrap_or_else(|| json!({}));

                let sender_name = value
                    .get("contacts")
                    .and_then(|v| v.as_array())
                    .and_then(|contacts| contacts.first())
                    .and_then(|c| c.get("profile"))
                    .and_then(|p| p.get("name"))
                    .and_then(|n| n.as_str())
                    .map(|s| s.to_string());

                for msg in value.get("messages").and_then(|v| v.as_array()).into_iter().flatten() {
                    match Self::normalize_message(msg, sender_name.as_deref()) {
                        Some(normalized) => items.push(InboundItem::Message(normalized)),
                        None => warn!("skipping malformed whatsapp message entry"),
                    }
                }

                for status in value.get("statuses").and_then(|v| v.as_array()).into_iter().flatten()
                {
                    if let Some(update) = Self::normalize_status(status) {
                        items.push(InboundItem::Status(update));
                    }
                }
            }
        }

        items
    }

    async fn send(
        &self,
        channel: &Channel,
        recipient: &str,
        content: &OutboundContent,
    ) -> Result<String, ProviderSendError> {
        let phone_id = channel.addressing_id().ok_or_else(|| {
            ProviderSendError::Misconfigured("channel has no phone_number_id".to_string())
        })?;
        let token = channel.access_token().ok_or_else(|| {
            ProviderSendError::Misconfigured("channel has no access_token".to_string())
        })?;

        let url = format!("{}/{}/messages", channel.api_base().trim_end_matches('/'), phone_id);
        let body = Self::build_send_body(recipient, content);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderSendError::Transport(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderSendError::Transport(e.to_string()))?;

        if !status.is_success() {
            let error = payload.get("error").cloned().unwrap_or_else(|| json!({}));
            return Err(ProviderSendError::Rejected {
                code: error
                    .get("code")
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| status.as_u16().to_string()),
                message: error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("send rejected")
                    .to_string(),
            });
        }

        payload
            .get("messages")
            .and_then(|v| v.as_array())
            .and_then(|messages| messages.first())
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderSendError::Transport("send response carried no message id".to_string())
            })
    }
}
