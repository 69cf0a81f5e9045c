use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaydesk_core::types::{
    Channel, InboundItem, MessageContent, NormalizedMessage, Provider, StatusKind, StatusUpdate,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::{OutboundContent, ProviderAdapter, ProviderSendError};

/// Messenger-style adapter: page-shaped webhook payloads
/// (`entry[].messaging[]`) and sends through `{api_base}/me/messages`.
pub struct MessengerAdapter {
    client: reqwest::Client,
}

impl MessengerAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn normalize_event(event: &Value, items: &mut Vec<InboundItem>) {
        let sender_id = event
            .get("sender")
            .and_then(|s| s.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let timestamp = event
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        if let Some(message) = event.get("message") {
            // Echoes are our own sends reflected back; the send pipeline
            // already recorded them.
            if message.get("is_echo").and_then(|v| v.as_bool()).unwrap_or(false) {
                return;
            }
            let Some(mid) = message.get("mid").and_then(|v| v.as_str()) else {
                warn!("skipping messenger message without mid");
                return;
            };

            items.push(InboundItem::Message(NormalizedMessage {
                provider_message_id: mid.to_string(),
                sender_id,
                sender_name: None,
                content: Self::message_content(message),
                timestamp,
            }));
            return;
        }

        if let Some(delivery) = event.get("delivery") {
            for mid in delivery.get("mids").and_then(|v| v.as_array()).into_iter().flatten() {
                if let Some(mid) = mid.as_str() {
                    items.push(InboundItem::Status(StatusUpdate {
                        provider_message_id: Some(mid.to_string()),
                        recipient_id: Some(sender_id.clone()),
                        kind: StatusKind::Delivered,
                    }));
                }
            }
            return;
        }

        if let Some(read) = event.get("read") {
            let Some(watermark) = read
                .get("watermark")
                .and_then(|v| v.as_i64())
                .and_then(DateTime::<Utc>::from_timestamp_millis)
            else {
                warn!("skipping messenger read receipt without watermark");
                return;
            };
            items.push(InboundItem::Status(StatusUpdate {
                provider_message_id: None,
                recipient_id: Some(sender_id),
                kind: StatusKind::ReadWatermark { watermark },
            }));
        }
    }

    fn message_content(message: &Value) -> MessageContent {
        if let Some(text) = message.get("text").and_then(|v| v.as_str()) {
            return MessageContent::Text { body: text.to_string() };
        }

        let attachment = message
            .get("attachments")
            .and_then(|v| v.as_array())
            .and_then(|attachments| attachments.first());
        let Some(attachment) = attachment else {
            return MessageContent::Unsupported { kind: "empty".to_string() };
        };

        let kind = attachment.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let url = attachment
            .get("payload")
            .and_then(|p| p.get("url"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        match (kind, url) {
            ("image", Some(url)) => MessageContent::Image { media_ref: url, caption: None },
            ("audio", Some(url)) => MessageContent::Audio { media_ref: url },
            ("video", Some(url)) => MessageContent::Video { media_ref: url, caption: None },
            ("file", Some(url)) => MessageContent::Document { media_ref: url, filename: None },
            ("location", _) => {
                let coordinates = attachment
                    .get("payload")
                    .and_then(|p| p.get("coordinates"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match (
                    coordinates.get("lat").and_then(|v| v.as_f64()),
                    coordinates.get("long").and_then(|v| v.as_f64()),
                ) {
                    (Some(latitude), Some(longitude)) => {
                        MessageContent::Location { latitude, longitude, name: None }
                    }
                    _ => MessageContent::Unsupported { kind: "location".to_string() },
                }
            }
            (other, _) => MessageContent::Unsupported { kind: other.to_string() },
        }
    }

    fn build_send_body(recipient: &str, content: &OutboundContent) -> Value {
        let message = match (&content.media_ref, content.media_type.as_deref()) {
            (Some(url), Some(kind @ ("image" | "audio" | "video" | "file" | "document"))) => {
                let attachment_type = if kind == "document" { "file" } else { kind };
                json!({
                    "attachment": {
                        "type": attachment_type,
                        "payload": { "url": url, "is_reusable": true }
                    }
                })
            }
            _ => json!({ "text": content.body.clone().unwrap_or_default() }),
        };

        json!({
            "recipient": { "id": recipient },
            "messaging_type": "RESPONSE",
            "message": message,
        })
    }
}

#[async_trait]
impl ProviderAdapter for MessengerAdapter {
    fn provider(&self) -> Provider {
        Provider::Messenger
    }

    fn addressing_id(&self, payload: &Value) -> Option<String> {
        payload
            .get("entry")?
            .as_array()?
            .iter()
            .find_map(|entry| entry.get("id").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
    }

    fn normalize(&self, payload: &Value) -> Vec<InboundItem> {
        let mut items = Vec::new();

        let entries = payload
            .get("entry")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            for event in entry.get("messaging").and_then(|v| v.as_array()).into_iter().flatten() {
                Self::normalize_event(event, &mut items);
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
        let token = channel.access_token().ok_or_else(|| {
            ProviderSendError::Misconfigured("channel has no access_token".to_string())
        })?;

        let url = format!("{}/me/messages", channel.api_base().trim_end_matches('/'));
        let body = Self::build_send_body(recipient, content);

        let response = self
            .client
            .post(&url)
            .query(&[("access_token", token)])
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
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderSendError::Transport("send response carried no message id".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_id_is_the_page_entry_id() {
        let adapter = MessengerAdapter::new(reqwest::Client::new());
        let payload = json!({ "object": "page", "entry": [{ "id": "page-77", "messaging": [] }] });
        assert_eq!(adapter.addressing_id(&payload).as_deref(), Some("page-77"));
    }

    #[test]
    fn text_and_attachment_messages_normalize() {
        let adapter = MessengerAdapter::new(reqwest::Client::new());
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-77",
                "messaging": [
                    {
                        "sender": { "id": "psid-1" },
                        "recipient": { "id": "page-77" },
                        "timestamp": 1717000000000i64,
                        "message": { "mid": "mid.A", "text": "hey" }
                    },
                    {
                        "sender": { "id": "psid-1" },
                        "recipient": { "id": "page-77" },
                        "timestamp": 1717000001000i64,
                        "message": {
                            "mid": "mid.B",
                            "attachments": [{ "type": "image", "payload": { "url": "https://cdn/img.png" } }]
                        }
                    }
                ]
            }]
        });

        let items = adapter.normalize(&payload);
        assert_eq!(items.len(), 2);
        match &items[0] {
            InboundItem::Message(m) => {
                assert_eq!(m.provider_message_id, "mid.A");
                assert_eq!(m.sender_id, "psid-1");
                assert_eq!(m.content, MessageContent::Text { body: "hey".into() });
            }
            other => panic!("expected message, got {:?}", other),
        }
        match &items[1] {
            InboundItem::Message(m) => {
                assert_eq!(
                    m.content,
                    MessageContent::Image { media_ref: "https://cdn/img.png".into(), caption: None }
                );
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn echoes_are_skipped() {
        let adapter = MessengerAdapter::new(reqwest::Client::new());
        let payload = json!({
            "entry": [{ "messaging": [{
                "sender": { "id": "page-77" },
                "message": { "mid": "mid.E", "text": "our own reply", "is_echo": true }
            }] }]
        });
        assert!(adapter.normalize(&payload).is_empty());
    }

    #[test]
    fn delivery_and_read_normalize_to_statuses() {
        let adapter = MessengerAdapter::new(reqwest::Client::new());
        let payload = json!({
            "entry": [{ "messaging": [
                {
                    "sender": { "id": "psid-1" },
                    "delivery": { "mids": ["mid.A", "mid.B"], "watermark": 1717000002000i64 }
                },
                {
                    "sender": { "id": "psid-1" },
                    "read": { "watermark": 1717000003000i64 }
                }
            ] }]
        });

        let items = adapter.normalize(&payload);
        assert_eq!(items.len(), 3);
        match &items[0] {
            InboundItem::Status(s) => {
                assert_eq!(s.provider_message_id.as_deref(), Some("mid.A"));
                assert_eq!(s.kind, StatusKind::Delivered);
            }
            other => panic!("expected status, got {:?}", other),
        }
        match &items[2] {
            InboundItem::Status(s) => {
                assert!(s.provider_message_id.is_none());
                assert!(matches!(s.kind, StatusKind::ReadWatermark { .. }));
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn send_body_shapes_follow_content() {
        let text = MessengerAdapter::build_send_body(
            "psid-1",
            &OutboundContent { body: Some("Hello".into()), media_ref: None, media_type: None },
        );
        assert_eq!(text["recipient"]["id"], "psid-1");
        assert_eq!(text["message"]["text"], "Hello");

        let media = MessengerAdapter::build_send_body(
            "psid-1",
            &OutboundContent {
                body: None,
                media_ref: Some("https://cdn/doc.pdf".into()),
                media_type: Some("document".into()),
            },
        );
        assert_eq!(media["message"]["attachment"]["type"], "file");
        assert_eq!(media["message"]["attachment"]["payload"]["url"], "https://cdn/doc.pdf");
    }
}
