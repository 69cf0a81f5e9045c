use chrono::{Duration as ChronoDuration, Utc};
use relaydesk_core::types::{
    AgentPresence, AgentRole, Channel, Contact, ConversationEventType, ConversationStatus,
    MessageStatus, Organization, Provider,
};
use relaydesk_persistence::{ConversationFilter, InboxStore, InsertOutcome, StatusAdvance};
use serde_json::json;

struct Fixture {
    store: InboxStore,
    org: Organization,
    channel: Channel,
    contact: Contact,
}

async fn fixture() -> Fixture {
    let store = InboxStore::connect("sqlite::memory:").await.unwrap();
    let org = store.create_organization("acme", "Acme Corp").await.unwrap();
    let channel = store
        .create_channel(
            org.id,
            Provider::WhatsApp,
            json!({ "phone_number_id": "15550001111", "access_token": "tok" }),
            "verify-token",
            Some("app-secret"),
        )
        .await
        .unwrap();
    let contact = store
        .upsert_contact(org.id, Provider::WhatsApp, "+15559876543", Some("Dana"))
        .await
        .unwrap();

    Fixture { store, org, channel, contact }
}

#[tokio::test]
async fn contact_upsert_keeps_existing_display_name() {
    let f = fixture().await;

    assert_eq!(f.contact.display_name.as_deref(), Some("Dana"));

    let again = f
        .store
        .upsert_contact(f.org.id, Provider::WhatsApp, "+15559876543", None)
        .await
        .unwrap();
    assert_eq!(again.id, f.contact.id);
    assert_eq!(again.display_name.as_deref(), Some("Dana"));

    let anonymous = f
        .store
        .upsert_contact(f.org.id, Provider::WhatsApp, "+15550000000", None)
        .await
        .unwrap();
    assert!(anonymous.display_name.is_none());

    let named = f
        .store
        .upsert_contact(f.org.id, Provider::WhatsApp, "+15550000000", Some("Robin"))
        .await
        .unwrap();
    assert_eq!(named.id, anonymous.id);
    assert_eq!(named.display_name.as_deref(), Some("Robin"));
}

#[tokio::test]
async fn channel_resolves_by_addressing_id() {
    let f = fixture().await;

    let found = f
        .store
        .channel_by_addressing(Provider::WhatsApp, "15550001111")
        .await
        .unwrap()
        .expect("channel should resolve");
    assert_eq!(found.id, f.channel.id);

    assert!(f
        .store
        .channel_by_addressing(Provider::WhatsApp, "0000")
        .await
        .unwrap()
        .is_none());
    assert!(f
        .store
        .channel_by_addressing(Provider::Messenger, "15550001111")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn conversation_create_appends_created_event() {
    let f = fixture().await;

    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();
    assert_eq!(conv.status, ConversationStatus::Pending);
    assert!(conv.assigned_agent_id.is_none());

    let events = f.store.events_for_conversation(conv.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ConversationEventType::Created);

    let active = f
        .store
        .active_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();
    assert_eq!(active.map(|c| c.id), Some(conv.id));
}

#[tokio::test]
async fn assignment_is_conditional_on_pending() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();
    let other = f.store.create_agent(f.org.id, "a2", AgentRole::Agent).await.unwrap();

    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    assert!(f.store.assign_conversation(conv.id, agent.id).await.unwrap());
    // Second taker loses: the row is no longer PENDING.
    assert!(!f.store.assign_conversation(conv.id, other.id).await.unwrap());

    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ConversationStatus::Assigned);
    assert_eq!(loaded.assigned_agent_id, Some(agent.id));
}

#[tokio::test]
async fn release_and_complete_are_owner_scoped() {
    let f = fixture().await;
    let owner = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();
    let stranger = f.store.create_agent(f.org.id, "a2", AgentRole::Agent).await.unwrap();

    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();
    assert!(f.store.assign_conversation(conv.id, owner.id).await.unwrap());

    assert!(!f
        .store
        .release_conversation(conv.id, stranger.id, ConversationEventType::Released)
        .await
        .unwrap());
    assert!(!f.store.complete_conversation(conv.id, stranger.id).await.unwrap());

    assert!(f
        .store
        .release_conversation(conv.id, owner.id, ConversationEventType::Released)
        .await
        .unwrap());
    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ConversationStatus::Pending);
    assert!(loaded.assigned_agent_id.is_none());

    assert!(f.store.assign_conversation(conv.id, owner.id).await.unwrap());
    assert!(f.store.complete_conversation(conv.id, owner.id).await.unwrap());
    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ConversationStatus::Completed);
    assert!(loaded.assigned_agent_id.is_none());
}

#[tokio::test]
async fn reopen_only_applies_to_completed() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();

    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();
    assert!(!f.store.reopen_conversation(conv.id).await.unwrap());

    f.store.assign_conversation(conv.id, agent.id).await.unwrap();
    f.store.complete_conversation(conv.id, agent.id).await.unwrap();

    assert!(f.store.reopen_conversation(conv.id).await.unwrap());
    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ConversationStatus::Pending);
    assert!(loaded.assigned_agent_id.is_none());

    let events = f.store.events_for_conversation(conv.id).await.unwrap();
    assert_eq!(events[0].event_type, ConversationEventType::Reopened);
}

#[tokio::test]
async fn inbound_insert_dedupes_on_provider_message_id() {
    let f = fixture().await;
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let first = f
        .store
        .insert_inbound_message(conv.id, "wamid.DUP", Some("hi".into()), None, None, Utc::now())
        .await
        .unwrap();
    assert!(matches!(first, InsertOutcome::Inserted(_)));

    for _ in 0..2 {
        let again = f
            .store
            .insert_inbound_message(conv.id, "wamid.DUP", Some("hi".into()), None, None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(again, InsertOutcome::Duplicate));
    }

    let (page, next) = f.store.messages_page(conv.id, None, 50).await.unwrap();
    assert_eq!(page.len(), 1);
    assert!(next.is_none());
    assert_eq!(page[0].status, MessageStatus::Delivered);
    assert_eq!(page[0].provider_message_id.as_deref(), Some("wamid.DUP"));
}

#[tokio::test]
async fn status_callbacks_never_regress() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let msg = f
        .store
        .insert_outbound_message(conv.id, agent.id, Some("Hello".into()), None, None)
        .await
        .unwrap();
    assert_eq!(msg.status, MessageStatus::Pending);

    let sent = f.store.mark_message_sent(msg.id, "wamid.OUT1").await.unwrap().unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);

    let advanced = f
        .store
        .advance_message_status("wamid.OUT1", MessageStatus::Read)
        .await
        .unwrap();
    assert!(matches!(advanced, StatusAdvance::Applied(ref m) if m.status == MessageStatus::Read));

    // Late DELIVERED after READ is dropped, not persisted.
    let late = f
        .store
        .advance_message_status("wamid.OUT1", MessageStatus::Delivered)
        .await
        .unwrap();
    assert!(matches!(late, StatusAdvance::Dropped));
    let loaded = f.store.message(msg.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, MessageStatus::Read);

    // READ is past the point where FAILED can absorb.
    assert!(f
        .store
        .mark_message_failed(msg.id, "131000", "late failure")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_provider_message_id_is_reported() {
    let f = fixture().await;
    let advanced = f
        .store
        .advance_message_status("wamid.NOPE", MessageStatus::Delivered)
        .await
        .unwrap();
    assert!(matches!(advanced, StatusAdvance::NotFound));
}

#[tokio::test]
async fn watermark_reads_cover_older_outbound() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let m1 = f
        .store
        .insert_outbound_message(conv.id, agent.id, Some("one".into()), None, None)
        .await
        .unwrap();
    f.store.mark_message_sent(m1.id, "mid.1").await.unwrap();
    let m2 = f
        .store
        .insert_outbound_message(conv.id, agent.id, Some("two".into()), None, None)
        .await
        .unwrap();
    f.store.mark_message_sent(m2.id, "mid.2").await.unwrap();

    // Halfway between the two sends, so only the first is covered.
    let watermark = m1.created_at + (m2.created_at - m1.created_at) / 2;
    let advanced = f.store.read_up_to_watermark(conv.id, watermark).await.unwrap();
    assert_eq!(advanced.len(), 1);
    assert_eq!(advanced[0].id, m1.id);

    assert_eq!(
        f.store.message(m1.id).await.unwrap().unwrap().status,
        MessageStatus::Read
    );
    assert_eq!(
        f.store.message(m2.id).await.unwrap().unwrap().status,
        MessageStatus::Sent
    );
}

#[tokio::test]
async fn cursor_pagination_returns_every_message_once() {
    let f = fixture().await;
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let total = 7;
    for i in 0..total {
        let at = Utc::now() + ChronoDuration::milliseconds(i);
        f.store
            .insert_inbound_message(conv.id, &format!("wamid.{}", i), Some(format!("m{}", i)), None, None, at)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let (page, next) = f.store.messages_page(conv.id, cursor, 3).await.unwrap();
        for window in page.windows(2) {
            assert!(window[0].created_at >= window[1].created_at);
        }
        let exhausted = next.is_none();
        if !exhausted {
            assert_eq!(page.len(), 3);
        }
        seen.extend(page.into_iter().map(|m| m.id));
        if exhausted {
            break;
        }
        cursor = next;
    }

    assert_eq!(seen.len(), total as usize);
    let unique: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());
}

#[tokio::test]
async fn last_message_at_only_moves_forward() {
    let f = fixture().await;
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let now = Utc::now();
    f.store.touch_last_message(conv.id, now).await.unwrap();
    f.store
        .touch_last_message(conv.id, now - ChronoDuration::seconds(60))
        .await
        .unwrap();

    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.last_message_at, Some(now));
}

#[tokio::test]
async fn first_response_is_set_once() {
    let f = fixture().await;
    let conv = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();

    let first = Utc::now();
    f.store.set_first_response(conv.id, first).await.unwrap();
    f.store
        .set_first_response(conv.id, first + ChronoDuration::seconds(120))
        .await
        .unwrap();

    let loaded = f.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(loaded.first_response_at, Some(first));
}

#[tokio::test]
async fn list_filters_compose() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();

    let other_contact = f
        .store
        .upsert_contact(f.org.id, Provider::WhatsApp, "+15551112222", Some("Sam"))
        .await
        .unwrap();

    let c1 = f
        .store
        .create_conversation(f.org.id, f.channel.id, f.contact.id)
        .await
        .unwrap();
    let _c2 = f
        .store
        .create_conversation(f.org.id, f.channel.id, other_contact.id)
        .await
        .unwrap();
    f.store.assign_conversation(c1.id, agent.id).await.unwrap();

    let assigned = f
        .store
        .list_conversations(
            f.org.id,
            &ConversationFilter {
                status: Some(ConversationStatus::Assigned),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].conversation.id, c1.id);
    assert_eq!(assigned[0].assigned_agent.as_ref().map(|a| a.id), Some(agent.id));
    assert_eq!(assigned[0].contact.display_name.as_deref(), Some("Dana"));

    let searched = f
        .store
        .list_conversations(
            f.org.id,
            &ConversationFilter { search: Some("Sam".into()), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].contact.id, other_contact.id);

    let by_agent = f
        .store
        .list_conversations(
            f.org.id,
            &ConversationFilter { agent_id: Some(agent.id), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(by_agent.len(), 1);
}

#[tokio::test]
async fn agent_sessions_track_presence() {
    let f = fixture().await;
    let agent = f.store.create_agent(f.org.id, "a1", AgentRole::Agent).await.unwrap();

    let session = f.store.open_agent_session(agent.id, "conn-1").await.unwrap();
    assert_eq!(session.status, AgentPresence::Online);

    let away = f
        .store
        .set_session_status("conn-1", AgentPresence::Away)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(away.status, AgentPresence::Away);

    let closed = f.store.close_agent_session("conn-1").await.unwrap();
    assert!(closed.is_some());
    assert!(f.store.agent_session("conn-1").await.unwrap().is_none());
}
