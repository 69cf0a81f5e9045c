use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// External messaging provider a channel is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    WhatsApp,
    Messenger,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::WhatsApp => "whatsapp",
            Provider::Messenger => "messenger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(Provider::WhatsApp),
            "messenger" => Some(Provider::Messenger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Active,
    Inactive,
    Error,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "ACTIVE",
            ChannelStatus::Inactive => "INACTIVE",
            ChannelStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ChannelStatus::Active),
            "INACTIVE" => Some(ChannelStatus::Inactive),
            "ERROR" => Some(ChannelStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Pending,
    Assigned,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Pending => "PENDING",
            ConversationStatus::Assigned => "ASSIGNED",
            ConversationStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ConversationStatus::Pending),
            "ASSIGNED" => Some(ConversationStatus::Assigned),
            "COMPLETED" => Some(ConversationStatus::Completed),
            _ => None,
        }
    }

    /// PENDING and ASSIGNED count as active; at most one active conversation
    /// exists per (organization, channel, contact).
    pub fn is_active(&self) -> bool {
        matches!(self, ConversationStatus::Pending | ConversationStatus::Assigned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "INBOUND",
            MessageDirection::Outbound => "OUTBOUND",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INBOUND" => Some(MessageDirection::Inbound),
            "OUTBOUND" => Some(MessageDirection::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(MessageStatus::Pending),
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" => Some(MessageStatus::Read),
            "FAILED" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Forward-only transition check. FAILED absorbs PENDING and SENT;
    /// everything else must strictly advance along PENDING→SENT→DELIVERED→READ.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Pending, MessageStatus::Failed)
            | (MessageStatus::Sent, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (MessageStatus::Failed, _) => false,
            (current, next) => *current < next,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationEventType {
    Created,
    Reopened,
    Accepted,
    Released,
    Completed,
    AgentDisconnected,
    MessageReceived,
    MessageSent,
    MessageDelivered,
    MessageRead,
    MessageFailed,
}

impl ConversationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationEventType::Created => "CREATED",
            ConversationEventType::Reopened => "REOPENED",
            ConversationEventType::Accepted => "ACCEPTED",
            ConversationEventType::Released => "RELEASED",
            ConversationEventType::Completed => "COMPLETED",
            ConversationEventType::AgentDisconnected => "AGENT_DISCONNECTED",
            ConversationEventType::MessageReceived => "MESSAGE_RECEIVED",
            ConversationEventType::MessageSent => "MESSAGE_SENT",
            ConversationEventType::MessageDelivered => "MESSAGE_DELIVERED",
            ConversationEventType::MessageRead => "MESSAGE_READ",
            ConversationEventType::MessageFailed => "MESSAGE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ConversationEventType::Created),
            "REOPENED" => Some(ConversationEventType::Reopened),
            "ACCEPTED" => Some(ConversationEventType::Accepted),
            "RELEASED" => Some(ConversationEventType::Released),
            "COMPLETED" => Some(ConversationEventType::Completed),
            "AGENT_DISCONNECTED" => Some(ConversationEventType::AgentDisconnected),
            "MESSAGE_RECEIVED" => Some(ConversationEventType::MessageReceived),
            "MESSAGE_SENT" => Some(ConversationEventType::MessageSent),
            "MESSAGE_DELIVERED" => Some(ConversationEventType::MessageDelivered),
            "MESSAGE_READ" => Some(ConversationEventType::MessageRead),
            "MESSAGE_FAILED" => Some(ConversationEventType::MessageFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentPresence {
    Online,
    Away,
    Offline,
}

impl AgentPresence {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPresence::Online => "ONLINE",
            AgentPresence::Away => "AWAY",
            AgentPresence::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(AgentPresence::Online),
            "AWAY" => Some(AgentPresence::Away),
            "OFFLINE" => Some(AgentPresence::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Agent,
    Admin,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Agent => "AGENT",
            AgentRole::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AGENT" => Some(AgentRole::Agent),
            "ADMIN" => Some(AgentRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A configured connection to one provider endpoint (one WhatsApp-style
/// number or one Messenger-style page). `config` holds the provider-specific
/// addressing id and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: Provider,
    pub config: Value,
    pub webhook_secret: String,
    pub app_secret: Option<String>,
    pub status: ChannelStatus,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// The id an inbound webhook addresses this channel by:
    /// `phone_number_id` for WhatsApp-style, `page_id` for Messenger-style.
    pub fn addressing_id(&self) -> Option<&str> {
        let key = match self.provider {
            Provider::WhatsApp => "phone_number_id",
            Provider::Messenger => "page_id",
        };
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.config.get("access_token").and_then(|v| v.as_str())
    }

    pub fn api_base(&self) -> &str {
        self.config
            .get("api_base")
            .and_then(|v| v.as_str())
            .unwrap_or("https://graph.facebook.com/v20.0")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: Provider,
    pub provider_id: String,
    pub display_name: Option<String>,
    pub metadata: Value,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    pub status: ConversationStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: MessageDirection,
    pub agent_id: Option<Uuid>,
    pub body: Option<String>,
    pub media_ref: Option<String>,
    pub media_type: Option<String>,
    pub provider_message_id: Option<String>,
    pub status: MessageStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub event_type: ConversationEventType,
    pub actor_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub connection_id: String,
    pub status: AgentPresence,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Slim agent row used for joins; agent CRUD lives outside this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: Uuid,
    pub display_name: String,
    pub role: AgentRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: Uuid,
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationWithRelations {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub contact: Contact,
    pub channel: ChannelRef,
    pub assigned_agent: Option<AgentRef>,
}

/// Provider payload content, normalized to a closed set of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { body: String },
    Image { media_ref: String, caption: Option<String> },
    Audio { media_ref: String },
    Video { media_ref: String, caption: Option<String> },
    Document { media_ref: String, filename: Option<String> },
    Location { latitude: f64, longitude: f64, name: Option<String> },
    Unsupported { kind: String },
}

impl MessageContent {
    /// Fold the variant into the flat `(body, media_ref, media_type)` shape
    /// the message table stores.
    pub fn into_parts(self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            MessageContent::Text { body } => (Some(body), None, None),
            MessageContent::Image { media_ref, caption } => {
                (caption, Some(media_ref), Some("image".to_string()))
            }
            MessageContent::Audio { media_ref } => {
                (None, Some(media_ref), Some("audio".to_string()))
            }
            MessageContent::Video { media_ref, caption } => {
                (caption, Some(media_ref), Some("video".to_string()))
            }
            MessageContent::Document { media_ref, filename } => {
                (filename, Some(media_ref), Some("document".to_string()))
            }
            MessageContent::Location { latitude, longitude, name } => {
                let body = match name {
                    Some(name) => format!("{} ({}, {})", name, latitude, longitude),
                    None => format!("{}, {}", latitude, longitude),
                };
                (Some(body), None, Some("location".to_string()))
            }
            MessageContent::Unsupported { kind } => {
                (Some(format!("[unsupported: {}]", kind)), None, None)
            }
        }
    }
}

/// One inbound message after provider normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub provider_message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A delivery-status callback after provider normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub provider_message_id: Option<String>,
    pub recipient_id: Option<String>,
    pub kind: StatusKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusKind {
    Sent,
    Delivered,
    Read,
    Failed { code: String, message: String },
    /// Messenger-style read receipt: everything at or before the watermark
    /// has been read.
    ReadWatermark { watermark: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundItem {
    Message(NormalizedMessage),
    Status(StatusUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_moves_forward_only() {
        use MessageStatus::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Pending.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Read));
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
    }

    #[test]
    fn failed_absorbs_pending_and_sent_only() {
        use MessageStatus::*;
        assert!(Pending.can_advance_to(Failed));
        assert!(Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(!Read.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Read));
    }

    #[test]
    fn content_folds_to_storage_parts() {
        let (body, media, kind) = MessageContent::Text { body: "hi".into() }.into_parts();
        assert_eq!(body.as_deref(), Some("hi"));
        assert!(media.is_none());
        assert!(kind.is_none());

        let (body, media, kind) = MessageContent::Image {
            media_ref: "media-1".into(),
            caption: Some("pic".into()),
        }
        .into_parts();
        assert_eq!(body.as_deref(), Some("pic"));
        assert_eq!(media.as_deref(), Some("media-1"));
        assert_eq!(kind.as_deref(), Some("image"));
    }

    #[test]
    fn channel_addressing_id_follows_provider() {
        let wa = Channel {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            provider: Provider::WhatsApp,
            config: serde_json::json!({ "phone_number_id": "123", "page_id": "999" }),
            webhook_secret: "vt".into(),
            app_secret: None,
            status: ChannelStatus::Active,
            created_at: Utc::now(),
        };
        assert_eq!(wa.addressing_id(), Some("123"));

        let mut fb = wa.clone();
        fb.provider = Provider::Messenger;
        assert_eq!(fb.addressing_id(), Some("999"));
    }

    #[test]
    fn enum_round_trips() {
        for s in [ConversationStatus::Pending, ConversationStatus::Assigned, ConversationStatus::Completed] {
            assert_eq!(ConversationStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            MessageStatus::Pending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(Provider::parse("whatsapp"), Some(Provider::WhatsApp));
        assert_eq!(Provider::parse("smoke-signal"), None);
    }
}
