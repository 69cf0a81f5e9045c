mod common;

use std::sync::Arc;

use common::{ctx, drain_events, event_names};
use relaydesk_core::error::InboxError;
use relaydesk_core::types::{AgentRole, ConversationEventType, ConversationStatus, Provider};
use relaydesk_dispatch::ConversationService;

#[tokio::test]
async fn concurrent_accepts_admit_exactly_one_winner() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+15559876543", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();

    let service = Arc::new(ConversationService::new(
        c.store.clone(),
        c.coordination.clone(),
        c.bus.clone(),
    ));

    let mut agents = Vec::new();
    for i in 0..8 {
        agents.push(
            c.store
                .create_agent(c.org.id, &format!("agent-{}", i), AgentRole::Agent)
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for agent in &agents {
        let service = service.clone();
        let conversation_id = conversation.id;
        let org_id = c.org.id;
        let agent_id = agent.id;
        handles.push(tokio::spawn(async move {
            service.accept(conversation_id, org_id, agent_id).await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(conversation) => winners.push(conversation),
            Err(InboxError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 7);

    let final_state = c.store.conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(final_state.status, ConversationStatus::Assigned);
    let winner_id = final_state.assigned_agent_id.unwrap();
    assert!(agents.iter().any(|a| a.id == winner_id));
}

#[tokio::test]
async fn accept_publishes_assigned_and_updated() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+1555", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();
    let agent = c.store.create_agent(c.org.id, "a1", AgentRole::Agent).await.unwrap();

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());

    let mut rx = c.bus.subscribe();
    service.accept(conversation.id, c.org.id, agent.id).await.unwrap();

    let events = drain_events(&mut rx);
    assert_eq!(event_names(&events), vec!["conversation.assigned", "conversation.updated"]);
}

#[tokio::test]
async fn non_owner_release_is_forbidden_and_state_unchanged() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+1555", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();
    let owner = c.store.create_agent(c.org.id, "a1", AgentRole::Agent).await.unwrap();
    let stranger = c.store.create_agent(c.org.id, "a2", AgentRole::Agent).await.unwrap();

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());
    service.accept(conversation.id, c.org.id, owner.id).await.unwrap();

    let denied = service.release(conversation.id, c.org.id, stranger.id).await;
    assert!(matches!(denied, Err(InboxError::Authz(_))));

    let unchanged = c.store.conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, ConversationStatus::Assigned);
    assert_eq!(unchanged.assigned_agent_id, Some(owner.id));

    let denied = service.complete(conversation.id, c.org.id, stranger.id).await;
    assert!(matches!(denied, Err(InboxError::Authz(_))));
}

#[tokio::test]
async fn completing_a_pending_conversation_conflicts() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+1555", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();
    let agent = c.store.create_agent(c.org.id, "a1", AgentRole::Agent).await.unwrap();

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());

    let denied = service.complete(conversation.id, c.org.id, agent.id).await;
    assert!(matches!(denied, Err(InboxError::Conflict(_))));
}

#[tokio::test]
async fn cross_org_access_reads_as_not_found() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+1555", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();

    let other_org = c.store.create_organization("globex", "Globex").await.unwrap();
    let outsider = c.store.create_agent(other_org.id, "b1", AgentRole::Agent).await.unwrap();

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());

    let denied = service.accept(conversation.id, other_org.id, outsider.id).await;
    assert!(matches!(denied, Err(InboxError::NotFound(_))));
}

#[tokio::test]
async fn disconnect_releases_every_assigned_conversation() {
    let c = ctx().await;
    let agent = c.store.create_agent(c.org.id, "a1", AgentRole::Agent).await.unwrap();

    let mut conversations = Vec::new();
    for i in 0..2 {
        let contact = c
            .store
            .upsert_contact(c.org.id, Provider::WhatsApp, &format!("+1555000{}", i), None)
            .await
            .unwrap();
        let conversation = c
            .store
            .create_conversation(c.org.id, c.channel.id, contact.id)
            .await
            .unwrap();
        c.store.assign_conversation(conversation.id, agent.id).await.unwrap();
        conversations.push(conversation);
    }

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());

    let mut rx = c.bus.subscribe();
    let released = service.release_by_agent(agent.id).await.unwrap();
    assert_eq!(released.len(), 2);

    for conversation in &conversations {
        let loaded = c.store.conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ConversationStatus::Pending);
        assert!(loaded.assigned_agent_id.is_none());

        let events = c.store.events_for_conversation(conversation.id).await.unwrap();
        assert_eq!(events[0].event_type, ConversationEventType::AgentDisconnected);
    }

    let events = drain_events(&mut rx);
    let released_events = events
        .iter()
        .filter(|e| e.name() == "conversation.released")
        .count();
    assert_eq!(released_events, 2);
}

#[tokio::test]
async fn stale_lock_does_not_wedge_accept_after_ttl() {
    let c = ctx().await;
    let contact = c
        .store
        .upsert_contact(c.org.id, Provider::WhatsApp, "+1555", None)
        .await
        .unwrap();
    let conversation = c
        .store
        .create_conversation(c.org.id, c.channel.id, contact.id)
        .await
        .unwrap();
    let agent = c.store.create_agent(c.org.id, "a1", AgentRole::Agent).await.unwrap();

    // Simulate a crashed holder: lock held with a short TTL and never
    // released.
    use relaydesk_coordination::CoordinationStore;
    let key = relaydesk_dispatch::conversations::conversation_lock_key(conversation.id);
    assert!(c
        .coordination
        .try_lock(&key, "ghost", std::time::Duration::from_millis(20))
        .await
        .unwrap());

    let service =
        ConversationService::new(c.store.clone(), c.coordination.clone(), c.bus.clone());

    let blocked = service.accept(conversation.id, c.org.id, agent.id).await;
    assert!(matches!(blocked, Err(InboxError::Conflict(_))));

    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    let accepted = service.accept(conversation.id, c.org.id, agent.id).await.unwrap();
    assert_eq!(accepted.assigned_agent_id, Some(agent.id));
}
