use std::sync::Arc;
use std::time::Duration;

use relaydesk_core::bus::{Event, EventBus};
use relaydesk_core::error::{InboxError, Result};
use relaydesk_core::types::{Conversation, ConversationEventType, ConversationStatus};
use relaydesk_coordination::CoordinationStore;
use relaydesk_persistence::InboxStore;
use tracing::{info, warn};
use uuid::Uuid;

/// TTL on the accept lock: long enough to cover the re-read plus the
/// assignment transaction, short enough that a crashed holder does not wedge
/// the conversation.
pub const ACCEPT_LOCK_TTL: Duration = Duration::from_secs(5);

pub fn conversation_lock_key(id: Uuid) -> String {
    format!("lock:conversation:{}", id)
}

/// The conversation state machine. Accept runs under a coordination-store
/// lock because agents on different instances race for the same PENDING
/// conversation; release, complete and reopen only need the row-level status
/// preconditions.
pub struct ConversationService {
    store: InboxStore,
    coordination: Arc<dyn CoordinationStore>,
    bus: Arc<EventBus>,
}

impl ConversationService {
    pub fn new(
        store: InboxStore,
        coordination: Arc<dyn CoordinationStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { store, coordination, bus }
    }

    async fn load_scoped(&self, id: Uuid, organization_id: Uuid) -> Result<Conversation> {
        let conversation = self
            .store
            .conversation(id)
            .await?
            .ok_or_else(|| InboxError::NotFound("conversation".to_string()))?;
        // Cross-org access reads as absence, never as 403.
        if conversation.organization_id != organization_id {
            return Err(InboxError::NotFound("conversation".to_string()));
        }
        Ok(conversation)
    }

    /// Accept protocol: lock, re-read, conditionally assign, unlock. The
    /// re-read after acquiring the lock is mandatory — the lock admits
    /// entrance but says nothing about the row's current status.
    pub async fn accept(
        &self,
        id: Uuid,
        organization_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Conversation> {
        let key = conversation_lock_key(id);
        let owner = agent_id.to_string();

        let acquired = self
            .coordination
            .try_lock(&key, &owner, ACCEPT_LOCK_TTL)
            .await
            .map_err(|e| InboxError::Transient(e.to_string()))?;
        if !acquired {
            return Err(InboxError::Conflict("conversation is being processed".to_string()));
        }

        let outcome = self.accept_locked(id, organization_id, agent_id).await;

        // Best-effort, owner-scoped: a failure here only means the lock runs
        // out its TTL.
        if let Err(e) = self.coordination.unlock(&key, &owner).await {
            warn!(conversation_id = %id, error = %e, "accept unlock failed");
        }

        outcome
    }

    async fn accept_locked(
        &self,
        id: Uuid,
        organization_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Conversation> {
        let conversation = self.load_scoped(id, organization_id).await?;
        if conversation.status != ConversationStatus::Pending {
            return Err(InboxError::Conflict("conversation is not available".to_string()));
        }

        if !self.store.assign_conversation(id, agent_id).await? {
            return Err(InboxError::Conflict("conversation is not available".to_string()));
        }

        let conversation = self.load_scoped(id, organization_id).await?;
        info!(conversation_id = %id, agent_id = %agent_id, "conversation accepted");

        self.bus.publish(Event::ConversationAssigned {
            conversation_id: id,
            organization_id,
            agent_id,
        });
        self.bus
            .publish(Event::ConversationUpdated { conversation_id: id, organization_id });

        Ok(conversation)
    }

    pub async fn release(
        &self,
        id: Uuid,
        organization_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Conversation> {
        let conversation = self.load_scoped(id, organization_id).await?;
        if conversation.status != ConversationStatus::Assigned {
            return Err(InboxError::Conflict("conversation is not assigned".to_string()));
        }
        if conversation.assigned_agent_id != Some(agent_id) {
            return Err(InboxError::Authz(
                "conversation is assigned to another agent".to_string(),
            ));
        }

        if !self
            .store
            .release_conversation(id, agent_id, ConversationEventType::Released)
            .await?
        {
            return Err(InboxError::Conflict("conversation is not assigned".to_string()));
        }

        info!(conversation_id = %id, agent_id = %agent_id, "conversation released");
        self.bus.publish(Event::ConversationReleased {
            conversation_id: id,
            organization_id,
            agent_id: Some(agent_id),
        });
        self.bus
            .publish(Event::ConversationUpdated { conversation_id: id, organization_id });

        self.load_scoped(id, organization_id).await
    }

    pub async fn complete(
        &self,
        id: Uuid,
        organization_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Conversation> {
        let conversation = self.load_scoped(id, organization_id).await?;
        if conversation.status != ConversationStatus::Assigned {
            return Err(InboxError::Conflict("conversation is not assigned".to_string()));
        }
        if conversation.assigned_agent_id != Some(agent_id) {
            return Err(InboxError::Authz(
                "conversation is assigned to another agent".to_string(),
            ));
        }

        if !self.store.complete_conversation(id, agent_id).await? {
            return Err(InboxError::Conflict("conversation is not assigned".to_string()));
        }

        info!(conversation_id = %id, agent_id = %agent_id, "conversation completed");
        self.bus.publish(Event::ConversationCompleted {
            conversation_id: id,
            organization_id,
            agent_id,
        });
        self.bus
            .publish(Event::ConversationUpdated { conversation_id: id, organization_id });

        self.load_scoped(id, organization_id).await
    }

    /// Disconnect compensation: everything the agent held goes back to
    /// PENDING with an AGENT_DISCONNECTED audit row. Partial failure releases
    /// what it can and reports the error.
    pub async fn release_by_agent(&self, agent_id: Uuid) -> Result<Vec<Conversation>> {
        let assigned = self.store.assigned_conversations(agent_id).await?;
        let mut released = Vec::with_capacity(assigned.len());

        for conversation in assigned {
            let ok = self
                .store
                .release_conversation(
                    conversation.id,
                    agent_id,
                    ConversationEventType::AgentDisconnected,
                )
                .await?;
            if !ok {
                // Raced with a concurrent release/complete; nothing to undo.
                continue;
            }

            self.bus.publish(Event::ConversationReleased {
                conversation_id: conversation.id,
                organization_id: conversation.organization_id,
                agent_id: Some(agent_id),
            });
            self.bus.publish(Event::ConversationUpdated {
                conversation_id: conversation.id,
                organization_id: conversation.organization_id,
            });

            released.push(conversation);
        }

        if !released.is_empty() {
            info!(agent_id = %agent_id, count = released.len(), "released conversations on disconnect");
        }
        Ok(released)
    }
}
