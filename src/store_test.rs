use super::*;
use crate::types::{ConversationStatus, Customer, MessageKind};

fn conversation(id: &str, updated_at: i64) -> Conversation {
    Conversation {
        id: id.to_owned(),
        customer: Customer { id: "cust-1".to_owned(), name: "Ana".to_owned(), phone: None },
        status: ConversationStatus::Active,
        assigned_to: None,
        last_message: None,
        unread_count: 0,
        updated_at,
    }
}

fn message(id: &str, sender: SenderKind, content: &str, timestamp: i64) -> Message {
    Message {
        id: id.to_owned(),
        conversation_id: "c1".to_owned(),
        sender,
        content: content.to_owned(),
        kind: MessageKind::Text,
        status: MessageStatus::Sent,
        timestamp,
        reply_to: None,
    }
}

fn store_with_conversation() -> ConversationStore {
    let mut store = ConversationStore::new();
    assert_eq!(store.apply_conversation(conversation("c1", 10)), ApplyOutcome::Inserted);
    store.take_dirty();
    store
}

fn ids(store: &ConversationStore) -> Vec<String> {
    store.messages("c1").into_iter().map(|m| m.id).collect()
}

fn summary_id(store: &ConversationStore) -> Option<String> {
    store
        .conversation("c1")
        .and_then(|c| c.last_message.as_ref())
        .and_then(|m| m.message_id.clone())
}

fn unread(store: &ConversationStore) -> u32 {
    store.conversation("c1").map_or(0, |c| c.unread_count)
}

// =============================================================================
// SERVER MESSAGES
// =============================================================================

#[test]
fn applying_same_server_message_twice_keeps_one_entry() {
    let mut store = store_with_conversation();
    let m1 = message("m1", SenderKind::Customer, "hi", 100);

    assert_eq!(store.apply_server_message("c1", m1.clone()), ApplyOutcome::Inserted);
    let first = store.snapshot("c1");
    assert_eq!(store.apply_server_message("c1", m1), ApplyOutcome::Unchanged);

    assert_eq!(store.snapshot("c1"), first);
    assert_eq!(ids(&store), vec!["m1"]);
    assert_eq!(unread(&store), 1);
}

#[test]
fn older_message_does_not_regress_summary() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "late", 200));
    store.apply_server_message("c1", message("m2", SenderKind::Customer, "early", 100));

    assert_eq!(ids(&store), vec!["m2", "m1"]);
    assert_eq!(summary_id(&store).as_deref(), Some("m1"));
    let summary = store.conversation("c1").and_then(|c| c.last_message.clone()).expect("summary");
    assert_eq!(summary.timestamp, 200);
}

#[test]
fn summary_tracks_maximum_timestamp_in_any_arrival_order() {
    let orders: [[i64; 4]; 3] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3]];
    for order in orders {
        let mut store = store_with_conversation();
        for ts in order {
            store.apply_server_message("c1", message(&format!("m{ts}"), SenderKind::Bot, "x", ts * 100));
        }
        assert_eq!(summary_id(&store).as_deref(), Some("m4"), "order {order:?}");
        assert_eq!(ids(&store), vec!["m1", "m2", "m3", "m4"], "order {order:?}");
    }
}

#[test]
fn unread_counts_only_newer_customer_messages() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "a", 100));
    store.apply_server_message("c1", message("m2", SenderKind::Bot, "b", 200));
    store.apply_server_message("c1", message("m3", SenderKind::Human, "c", 300));
    store.apply_server_message("c1", message("m0", SenderKind::Customer, "old", 50));

    assert_eq!(unread(&store), 1);
}

#[test]
fn server_update_in_place_never_regresses_status() {
    let mut store = store_with_conversation();
    let mut delivered = message("m1", SenderKind::Human, "hi", 100);
    delivered.status = MessageStatus::Delivered;
    store.apply_server_message("c1", delivered);

    let stale = message("m1", SenderKind::Human, "hi", 100);
    assert_eq!(store.apply_server_message("c1", stale), ApplyOutcome::Unchanged);
    assert_eq!(store.message("c1", "m1").map(|m| m.status), Some(MessageStatus::Delivered));

    let mut failed = message("m1", SenderKind::Human, "hi", 100);
    failed.status = MessageStatus::Failed;
    assert_eq!(store.apply_server_message("c1", failed), ApplyOutcome::Updated);
    assert_eq!(store.message("c1", "m1").map(|m| m.status), Some(MessageStatus::Failed));
}

#[test]
fn server_message_fills_in_conversation_id() {
    let mut store = store_with_conversation();
    let mut m1 = message("m1", SenderKind::Bot, "hi", 100);
    m1.conversation_id.clear();
    store.apply_server_message("c1", m1);
    assert_eq!(store.message("c1", "m1").map(|m| m.conversation_id.as_str()), Some("c1"));
}

// =============================================================================
// OPTIMISTIC MESSAGES
// =============================================================================

#[test]
fn optimistic_message_is_sending_and_leaves_unread_alone() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "hi", 100));

    let outcome = store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));
    assert_eq!(outcome, ApplyOutcome::Inserted);
    assert_eq!(store.message("c1", "local-1").map(|m| m.status), Some(MessageStatus::Sending));
    assert_eq!(unread(&store), 1);
    assert_eq!(summary_id(&store).as_deref(), Some("local-1"));
    assert!(store.has_pending("local-1"));
}

#[test]
fn duplicate_temporary_id_is_rejected() {
    let mut store = store_with_conversation();
    let local = message("local-1", SenderKind::Human, "hello", 200);
    store.apply_optimistic_message("c1", local.clone());
    assert_eq!(store.apply_optimistic_message("c1", local), ApplyOutcome::Unchanged);
    assert_eq!(ids(&store), vec!["local-1"]);
}

#[test]
fn confirm_replaces_temporary_entry_with_server_id() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));

    let outcome = store.confirm_optimistic_message("local-1", message("srv-9", SenderKind::Human, "hello", 200));

    assert_eq!(outcome, ApplyOutcome::Updated);
    assert_eq!(ids(&store), vec!["srv-9"]);
    assert_eq!(store.message("c1", "srv-9").map(|m| m.status), Some(MessageStatus::Sent));
    assert_eq!(summary_id(&store).as_deref(), Some("srv-9"));
    assert!(!store.has_pending("local-1"));
}

#[test]
fn confirm_preserves_position_between_neighbours() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "a", 100));
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "b", 200));
    store.apply_server_message("c1", message("m3", SenderKind::Customer, "c", 300));

    store.confirm_optimistic_message("local-1", message("srv-2", SenderKind::Human, "b", 200));

    assert_eq!(ids(&store), vec!["m1", "srv-2", "m3"]);
    assert_eq!(summary_id(&store).as_deref(), Some("m3"));
}

#[test]
fn push_echo_supersedes_local_entry_and_confirm_is_a_merge() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));

    let echo = message("srv-9", SenderKind::Human, "hello", 205);
    assert_eq!(store.apply_server_message("c1", echo.clone()), ApplyOutcome::Updated);
    assert_eq!(ids(&store), vec!["srv-9"]);
    assert_eq!(summary_id(&store).as_deref(), Some("srv-9"));
    assert!(store.has_pending("local-1"));

    assert_eq!(store.confirm_optimistic_message("local-1", echo), ApplyOutcome::Unchanged);
    assert_eq!(ids(&store), vec!["srv-9"]);
    assert!(!store.has_pending("local-1"));
}

#[test]
fn confirm_lands_when_lookalike_push_took_the_local_slot() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "ok", 300));
    // Another agent sends the same text before our send is acknowledged.
    store.apply_server_message("c1", message("srv-other", SenderKind::Human, "ok", 301));
    assert_eq!(ids(&store), vec!["srv-other"]);
    store.take_dirty();

    let outcome = store.confirm_optimistic_message("local-1", message("srv-9", SenderKind::Human, "ok", 302));

    assert_eq!(outcome, ApplyOutcome::Inserted);
    assert_eq!(ids(&store), vec!["srv-other", "srv-9"]);
    assert_eq!(summary_id(&store).as_deref(), Some("srv-9"));
    assert_eq!(unread(&store), 0);
    assert!(!store.has_pending("local-1"));
    assert_eq!(store.take_dirty(), vec!["c1".to_owned()]);

    assert_eq!(
        store.confirm_optimistic_message("local-1", message("srv-9", SenderKind::Human, "ok", 302)),
        ApplyOutcome::Unchanged
    );
    assert_eq!(ids(&store), vec!["srv-other", "srv-9"]);
}

#[test]
fn confirm_merges_when_push_already_inserted_server_id() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));
    // Different content, so the push is not recognized as an echo.
    store.apply_server_message("c1", message("srv-9", SenderKind::Human, "hello!", 210));

    let mut confirmed = message("srv-9", SenderKind::Human, "hello!", 210);
    confirmed.status = MessageStatus::Delivered;
    assert_eq!(store.confirm_optimistic_message("local-1", confirmed), ApplyOutcome::Updated);

    assert_eq!(ids(&store), vec!["srv-9"]);
    assert_eq!(store.message("c1", "srv-9").map(|m| m.status), Some(MessageStatus::Delivered));
}

#[test]
fn confirm_unknown_ids_is_not_found() {
    let mut store = store_with_conversation();
    let outcome = store.confirm_optimistic_message("local-x", message("srv-x", SenderKind::Human, "?", 1));
    assert_eq!(outcome, ApplyOutcome::NotFound);
    assert!(store.messages("c1").is_empty());
}

#[test]
fn customer_message_is_never_taken_for_an_echo() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "ok", 200));
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "ok", 201));
    assert_eq!(ids(&store), vec!["local-1", "m1"]);
}

#[test]
fn rollback_removes_entry_and_restores_summary() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "hi", 100));
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));
    assert_eq!(summary_id(&store).as_deref(), Some("local-1"));

    assert_eq!(store.rollback_optimistic_message("local-1"), ApplyOutcome::Removed);
    assert_eq!(ids(&store), vec!["m1"]);
    assert_eq!(summary_id(&store).as_deref(), Some("m1"));
    assert_eq!(store.rollback_optimistic_message("local-1"), ApplyOutcome::NotFound);
}

#[test]
fn rollback_on_empty_thread_restores_absent_summary() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));
    store.rollback_optimistic_message("local-1");
    assert!(store.conversation("c1").and_then(|c| c.last_message.as_ref()).is_none());
}

#[test]
fn server_entry_wins_identical_timestamp() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "mine", 100));
    store.apply_server_message("c1", message("m1", SenderKind::Bot, "theirs", 100));

    assert_eq!(ids(&store), vec!["m1", "local-1"]);
    assert_eq!(summary_id(&store).as_deref(), Some("m1"));

    let mut other = store_with_conversation();
    other.apply_server_message("c1", message("m1", SenderKind::Bot, "theirs", 100));
    other.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "mine", 100));
    assert_eq!(ids(&other), vec!["m1", "local-1"]);
    assert_eq!(summary_id(&other).as_deref(), Some("m1"));
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

#[test]
fn stale_patch_is_distinguished_from_unknown_conversation() {
    let mut store = store_with_conversation();
    let patch = ConversationPatch { status: Some(ConversationStatus::Closed), updated_at: 5, ..Default::default() };

    assert_eq!(store.apply_conversation_update("c1", patch.clone()), ApplyOutcome::Stale);
    assert_eq!(store.conversation("c1").map(|c| c.status), Some(ConversationStatus::Active));
    assert_eq!(store.apply_conversation_update("nope", patch), ApplyOutcome::NotFound);
    assert!(store.conversation("nope").is_none());
}

#[test]
fn patch_merges_present_fields_only() {
    let mut store = store_with_conversation();
    let patch = ConversationPatch {
        assigned_to: Some(Some("agent-7".to_owned())),
        updated_at: 20,
        ..Default::default()
    };
    assert_eq!(store.apply_conversation_update("c1", patch.clone()), ApplyOutcome::Updated);
    assert_eq!(store.apply_conversation_update("c1", patch), ApplyOutcome::Unchanged);

    let conv = store.conversation("c1").expect("conversation");
    assert_eq!(conv.assigned_to.as_deref(), Some("agent-7"));
    assert_eq!(conv.customer.name, "Ana");
    assert_eq!(conv.updated_at, 20);

    let unassign = ConversationPatch { assigned_to: Some(None), updated_at: 21, ..Default::default() };
    store.apply_conversation_update("c1", unassign);
    assert!(store.conversation("c1").and_then(|c| c.assigned_to.clone()).is_none());
}

#[test]
fn patched_summary_is_gated_by_message_timestamp() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "new", 500));

    let patch = ConversationPatch {
        last_message: Some(LastMessage {
            message_id: Some("m0".to_owned()),
            content: "old".to_owned(),
            timestamp: 100,
            sender: SenderKind::Customer,
        }),
        unread_count: Some(4),
        updated_at: 30,
        ..Default::default()
    };
    assert_eq!(store.apply_conversation_update("c1", patch), ApplyOutcome::Updated);

    let conv = store.conversation("c1").expect("conversation");
    assert_eq!(conv.last_message.as_ref().map(|m| m.content.as_str()), Some("new"));
    assert_eq!(conv.unread_count, 4);
}

#[test]
fn wholesale_conversation_is_timestamp_gated() {
    let mut store = store_with_conversation();
    let mut older = conversation("c1", 5);
    older.status = ConversationStatus::Archived;
    assert_eq!(store.apply_conversation(older), ApplyOutcome::Stale);

    let mut newer = conversation("c1", 50);
    newer.status = ConversationStatus::Closed;
    assert_eq!(store.apply_conversation(newer.clone()), ApplyOutcome::Updated);
    assert_eq!(store.apply_conversation(newer), ApplyOutcome::Unchanged);
    assert_eq!(store.conversation("c1").map(|c| c.status), Some(ConversationStatus::Closed));
}

#[test]
fn wholesale_conversation_keeps_newer_pushed_summary() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m2", SenderKind::Customer, "pushed", 900));

    let mut fetched = conversation("c1", 60);
    fetched.last_message = Some(LastMessage {
        message_id: Some("m1".to_owned()),
        content: "fetched".to_owned(),
        timestamp: 400,
        sender: SenderKind::Customer,
    });
    store.apply_conversation(fetched);

    assert_eq!(summary_id(&store).as_deref(), Some("m2"));
}

#[test]
fn merge_page_reports_each_outcome() {
    let mut store = store_with_conversation();
    let report = store.merge_page(vec![conversation("c1", 1), conversation("c2", 1), conversation("c1", 99)]);
    assert_eq!(report, MergeReport { inserted: 1, updated: 1, unchanged: 0, stale: 1 });
}

#[test]
fn conversations_are_listed_by_latest_activity() {
    let mut store = ConversationStore::new();
    store.apply_conversation(conversation("c1", 100));
    store.apply_conversation(conversation("c2", 300));
    store.apply_conversation(conversation("c3", 200));
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "x", 400));

    let order: Vec<_> = store.conversations().into_iter().map(|c| c.id).collect();
    assert_eq!(order, vec!["c1", "c2", "c3"]);
}

// =============================================================================
// READS, COUNTERS, DIRTY TRACKING
// =============================================================================

#[test]
fn optimistic_read_and_rollback_keep_new_arrivals() {
    let mut store = store_with_conversation();
    store.apply_server_message("c1", message("m1", SenderKind::Customer, "a", 100));
    store.apply_server_message("c1", message("m2", SenderKind::Customer, "b", 200));

    assert_eq!(store.apply_optimistic_read("c1"), Some(2));
    assert_eq!(unread(&store), 0);

    store.apply_server_message("c1", message("m3", SenderKind::Customer, "c", 300));
    assert_eq!(store.rollback_optimistic_read("c1", 2), ApplyOutcome::Updated);
    assert_eq!(unread(&store), 3);

    assert_eq!(store.apply_optimistic_read("missing"), None);
    assert_eq!(store.rollback_optimistic_read("missing", 1), ApplyOutcome::NotFound);
}

#[test]
fn counters_merge_and_flag_changes() {
    let mut store = ConversationStore::new();
    let counters = BTreeMap::from([("mine".to_owned(), 3), ("unassigned".to_owned(), 7)]);
    assert_eq!(store.apply_counters(counters.clone()), ApplyOutcome::Updated);
    assert!(store.take_counters_dirty());
    assert_eq!(store.apply_counters(counters), ApplyOutcome::Unchanged);
    assert!(!store.take_counters_dirty());
    assert_eq!(store.counters().get("unassigned"), Some(&7));
}

#[test]
fn dirty_set_names_only_changed_conversations() {
    let mut store = ConversationStore::new();
    store.apply_conversation(conversation("c1", 10));
    store.apply_conversation(conversation("c2", 10));
    store.take_dirty();

    store.apply_server_message("c2", message("m1", SenderKind::Bot, "x", 100));
    store.apply_conversation(conversation("c1", 1));

    assert_eq!(store.take_dirty(), vec!["c2".to_owned()]);
    assert!(store.take_dirty().is_empty());
}

#[test]
fn forget_conversation_drops_pending_bookkeeping() {
    let mut store = store_with_conversation();
    store.apply_optimistic_message("c1", message("local-1", SenderKind::Human, "hello", 200));

    assert_eq!(store.forget_conversation("c1"), ApplyOutcome::Removed);
    assert!(!store.has_pending("local-1"));
    assert!(store.conversation("c1").is_none());
    assert_eq!(store.forget_conversation("c1"), ApplyOutcome::NotFound);
}
