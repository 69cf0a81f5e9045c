use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{AgentPresence, MessageStatus};

/// Realtime events fanned out to agent consoles. Wire names follow the
/// `entity.change` convention so serialized envelopes match what clients
/// subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "conversation.new")]
    ConversationNew { conversation_id: Uuid, organization_id: Uuid },
    #[serde(rename = "conversation.updated")]
    ConversationUpdated { conversation_id: Uuid, organization_id: Uuid },
    #[serde(rename = "conversation.assigned")]
    ConversationAssigned { conversation_id: Uuid, organization_id: Uuid, agent_id: Uuid },
    #[serde(rename = "conversation.released")]
    ConversationReleased {
        conversation_id: Uuid,
        organization_id: Uuid,
        agent_id: Option<Uuid>,
    },
    #[serde(rename = "conversation.completed")]
    ConversationCompleted { conversation_id: Uuid, organization_id: Uuid, agent_id: Uuid },
    #[serde(rename = "message.new")]
    MessageNew { message_id: Uuid, conversation_id: Uuid, organization_id: Uuid },
    #[serde(rename = "message.updated")]
    MessageUpdated { message_id: Uuid, conversation_id: Uuid, status: MessageStatus },
    #[serde(rename = "agent.status_changed")]
    AgentStatusChanged { agent_id: Uuid, organization_id: Uuid, status: AgentPresence },
    #[serde(rename = "agent.typing")]
    AgentTyping { conversation_id: Uuid, agent_id: Uuid, typing: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConversationNew { .. } => "conversation.new",
            Event::ConversationUpdated { .. } => "conversation.updated",
            Event::ConversationAssigned { .. } => "conversation.assigned",
            Event::ConversationReleased { .. } => "conversation.released",
            Event::ConversationCompleted { .. } => "conversation.completed",
            Event::MessageNew { .. } => "message.new",
            Event::MessageUpdated { .. } => "message.updated",
            Event::AgentStatusChanged { .. } => "agent.status_changed",
            Event::AgentTyping { .. } => "agent.typing",
        }
    }

    /// The rooms this event is multicast to.
    pub fn rooms(&self) -> Vec<String> {
        match self {
            Event::ConversationNew { organization_id, .. }
            | Event::ConversationUpdated { organization_id, .. }
            | Event::ConversationAssigned { organization_id, .. }
            | Event::ConversationReleased { organization_id, .. }
            | Event::ConversationCompleted { organization_id, .. }
            | Event::AgentStatusChanged { organization_id, .. } => {
                vec![org_room(*organization_id)]
            }
            Event::MessageNew { conversation_id, organization_id, .. } => {
                vec![conv_room(*conversation_id), org_room(*organization_id)]
            }
            Event::MessageUpdated { conversation_id, .. }
            | Event::AgentTyping { conversation_id, .. } => vec![conv_room(*conversation_id)],
        }
    }
}

pub fn org_room(id: Uuid) -> String {
    format!("org:{}", id)
}

pub fn user_room(id: Uuid) -> String {
    format!("user:{}", id)
}

pub fn conv_room(id: Uuid) -> String {
    format!("conv:{}", id)
}

/// An event plus the instance that produced it. The origin id lets the
/// cross-instance bridge drop its own mirrored publishes instead of looping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub origin: Uuid,
    pub event: Event,
}

/// Process-local fan-out. Every publish reaches all in-process subscribers
/// (socket gateway, cross-instance bridge); room filtering happens at the
/// socket layer where membership lives.
pub struct EventBus {
    instance_id: Uuid,
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { instance_id: Uuid::new_v4(), tx }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish a locally-produced event. Send errors only mean there are no
    /// subscribers right now, which is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(EventEnvelope { origin: self.instance_id, event });
    }

    /// Re-publish an envelope received from another instance, preserving its
    /// origin so it is not mirrored back out.
    pub fn publish_remote(&self, envelope: EventEnvelope) {
        if envelope.origin == self.instance_id {
            return;
        }
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_new_targets_conversation_and_org() {
        let conv = Uuid::new_v4();
        let org = Uuid::new_v4();
        let rooms = Event::MessageNew {
            message_id: Uuid::new_v4(),
            conversation_id: conv,
            organization_id: org,
        }
        .rooms();
        assert_eq!(rooms, vec![format!("conv:{}", conv), format!("org:{}", org)]);
    }

    #[test]
    fn typing_stays_in_conversation_room() {
        let conv = Uuid::new_v4();
        let rooms = Event::AgentTyping {
            conversation_id: conv,
            agent_id: Uuid::new_v4(),
            typing: true,
        }
        .rooms();
        assert_eq!(rooms, vec![format!("conv:{}", conv)]);
    }

    #[test]
    fn wire_name_matches_serde_tag() {
        let event = Event::ConversationAssigned {
            conversation_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
    }

    #[tokio::test]
    async fn remote_publish_drops_own_origin() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let own = EventEnvelope {
            origin: bus.instance_id(),
            event: Event::ConversationNew {
                conversation_id: Uuid::new_v4(),
                organization_id: Uuid::new_v4(),
            },
        };
        bus.publish_remote(own);

        let foreign = EventEnvelope {
            origin: Uuid::new_v4(),
            event: Event::ConversationNew {
                conversation_id: Uuid::new_v4(),
                organization_id: Uuid::new_v4(),
            },
        };
        bus.publish_remote(foreign.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.origin, foreign.origin);
        assert!(rx.try_recv().is_err());
    }
}
