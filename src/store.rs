//! Reconciliation store: the in-memory cache of conversations and messages.
//!
//! DESIGN
//! ======
//! One `ConversationStore` holds all visible state. Push events, fetched
//! pages and optimistic mutations all funnel through the operations below;
//! callers never write fields directly. Every operation is synchronous,
//! total, and safe to repeat with the same arguments.
//!
//! ORDERING
//! ========
//! A thread's messages stay sorted by `(timestamp, origin)`, where server
//! entries sort before local ones at the same timestamp. A conversation's
//! `last_message` tracks the newest known entry and never moves backwards.
//! Conversation objects and patches are gated on `updated_at`; an older one
//! is reported as [`ApplyOutcome::Stale`] and changes nothing.
//!
//! Local message timestamps come from the client clock, so messages never
//! touch `updated_at`; that field stays server-owned.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::{
    Conversation, ConversationId, ConversationPatch, LastMessage, Message, MessageId, MessageStatus, SenderKind,
};

// =============================================================================
// TYPES
// =============================================================================

/// Result of a store operation. Only `Inserted`, `Updated`, and `Removed`
/// change visible state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Same data already held; nothing changed.
    Unchanged,
    /// Older than held state; ignored by timestamp gating.
    Stale,
    /// Target entity is not in the store.
    NotFound,
    Removed,
}

impl ApplyOutcome {
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

/// Where a cached message came from. Declaration order is the tie-break:
/// at equal timestamps server entries sort first and win the summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Server,
    Local,
}

/// Tallies from [`ConversationStore::merge_page`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale: usize,
}

/// Everything a view needs to render one conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    /// `None` while only messages are known for this id.
    pub conversation: Option<Conversation>,
    /// Ordered oldest first.
    pub messages: Vec<Message>,
    /// True while the live connection is not open; the data may lag the server.
    pub stale: bool,
}

#[derive(Clone, Debug)]
struct Entry {
    message: Message,
    origin: Origin,
    /// Summary held before this optimistic entry was inserted.
    prior_summary: Option<LastMessage>,
}

impl Entry {
    fn sort_key(&self) -> (i64, Origin) {
        (self.message.timestamp, self.origin)
    }
}

#[derive(Debug, Default)]
struct Thread {
    conversation: Option<Conversation>,
    messages: Vec<Entry>,
}

impl Thread {
    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|e| e.message.id == id)
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = entry.sort_key();
        let idx = self.messages.partition_point(|e| e.sort_key() <= key);
        self.messages.insert(idx, entry);
    }

    /// Stable, so an entry whose timestamp did not change keeps its slot.
    fn resort(&mut self) {
        self.messages.sort_by_key(Entry::sort_key);
    }

    /// Newest entry; at equal timestamps the server entry wins.
    fn newest(&self) -> Option<&Entry> {
        let max_ts = self.messages.last()?.message.timestamp;
        self.messages.iter().find(|e| e.message.timestamp == max_ts)
    }

    /// A still-sending local entry that a server message is the echo of.
    fn local_echo_of(&self, message: &Message) -> Option<usize> {
        if message.sender == SenderKind::Customer {
            return None;
        }
        self.messages.iter().position(|e| {
            e.origin == Origin::Local
                && e.message.status == MessageStatus::Sending
                && e.message.content == message.content
                && e.message.kind == message.kind
                && e.message.reply_to == message.reply_to
        })
    }

    fn is_local(&self, id: &str) -> bool {
        self.messages
            .iter()
            .any(|e| e.origin == Origin::Local && e.message.id == id)
    }

    /// Point a summary taken from `from_id` at `to` instead.
    fn retarget_summary(&mut self, from_id: &str, to: &Message) {
        if let Some(conversation) = self.conversation.as_mut()
            && let Some(summary) = conversation.last_message.as_ref()
            && summary.message_id.as_deref() == Some(from_id)
        {
            conversation.last_message = Some(LastMessage::from(to));
        }
    }

    /// Move the summary forward to the newest entry when that entry is newer.
    fn settle_summary(&mut self) {
        let Some(candidate) = self.newest().map(|e| LastMessage::from(&e.message)) else {
            return;
        };
        let replace = match self
            .conversation
            .as_ref()
            .and_then(|c| c.last_message.as_ref())
        {
            None => true,
            Some(current) if current.timestamp < candidate.timestamp => true,
            Some(current) if current.timestamp == candidate.timestamp => match current.message_id.as_deref() {
                None => true,
                Some(id) => candidate.message_id.as_deref() == Some(id) || self.is_local(id),
            },
            Some(_) => false,
        };
        if replace && let Some(conversation) = self.conversation.as_mut() {
            conversation.last_message = Some(candidate);
        }
    }

    fn summary_timestamp(&self) -> Option<i64> {
        self.conversation
            .as_ref()
            .and_then(|c| c.last_message.as_ref())
            .map(|m| m.timestamp)
    }

    fn snapshot(&self, conversation_id: &str) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: conversation_id.to_owned(),
            conversation: self.conversation.clone(),
            messages: self.messages.iter().map(|e| e.message.clone()).collect(),
            stale: false,
        }
    }
}

/// Keep delivery status from moving backwards unless the server reports failure.
fn merge_server_message(existing: &Message, incoming: Message) -> Message {
    let mut next = incoming;
    if next.status != MessageStatus::Failed && next.status.rank() < existing.status.rank() {
        next.status = existing.status;
    }
    next
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Default)]
pub struct ConversationStore {
    threads: HashMap<ConversationId, Thread>,
    /// Temporary id -> conversation holding the optimistic entry.
    local_index: HashMap<MessageId, ConversationId>,
    /// Temporary id -> (conversation, server id) for entries a push superseded
    /// before the send was confirmed.
    superseded: HashMap<MessageId, (ConversationId, MessageId)>,
    counters: BTreeMap<String, i64>,
    /// Conversations whose visible state changed since the last drain.
    dirty: BTreeSet<ConversationId>,
    counters_dirty: bool,
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Idempotent upsert of a server-confirmed message.
    ///
    /// An existing entry with the same id is updated in place. A server echo
    /// of a still-sending local entry replaces that entry. Anything else is
    /// inserted in timestamp order; a newer customer message bumps the
    /// unread counter once.
    pub fn apply_server_message(&mut self, conversation_id: &str, mut message: Message) -> ApplyOutcome {
        conversation_id.clone_into(&mut message.conversation_id);
        let thread = self.threads.entry(conversation_id.to_owned()).or_default();

        if let Some(idx) = thread.position(&message.id) {
            let outcome = merge_into(thread, idx, message);
            if outcome.changed() {
                self.dirty.insert(conversation_id.to_owned());
            }
            return outcome;
        }

        if let Some(idx) = thread.local_echo_of(&message) {
            let temp_id = thread.messages[idx].message.id.clone();
            thread.messages[idx] = Entry { message: message.clone(), origin: Origin::Server, prior_summary: None };
            thread.resort();
            thread.retarget_summary(&temp_id, &message);
            thread.settle_summary();
            self.local_index.remove(&temp_id);
            self.superseded
                .insert(temp_id, (conversation_id.to_owned(), message.id));
            self.dirty.insert(conversation_id.to_owned());
            return ApplyOutcome::Updated;
        }

        let previous_summary_ts = thread.summary_timestamp();
        let counts_as_unread = message.sender == SenderKind::Customer
            && previous_summary_ts.is_none_or(|ts| message.timestamp > ts);
        thread.insert_sorted(Entry { message, origin: Origin::Server, prior_summary: None });
        thread.settle_summary();
        if counts_as_unread && let Some(conversation) = thread.conversation.as_mut() {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Inserted
    }

    /// Insert a locally authored message under its temporary id with status
    /// `sending`. Unread counters are untouched. A temporary id already in the
    /// store is rejected as `Unchanged`.
    pub fn apply_optimistic_message(&mut self, conversation_id: &str, mut local: Message) -> ApplyOutcome {
        if self.local_index.contains_key(&local.id) || self.superseded.contains_key(&local.id) {
            return ApplyOutcome::Unchanged;
        }
        let thread = self.threads.entry(conversation_id.to_owned()).or_default();
        if thread.position(&local.id).is_some() {
            return ApplyOutcome::Unchanged;
        }

        conversation_id.clone_into(&mut local.conversation_id);
        local.status = MessageStatus::Sending;
        let prior_summary = thread
            .conversation
            .as_ref()
            .and_then(|c| c.last_message.clone());
        let temp_id = local.id.clone();
        thread.insert_sorted(Entry { message: local, origin: Origin::Local, prior_summary });
        thread.settle_summary();
        self.local_index.insert(temp_id, conversation_id.to_owned());
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Inserted
    }

    /// Replace an optimistic entry with its server-confirmed counterpart.
    ///
    /// When a push already delivered the server message, the confirmation
    /// merges into that entry instead of inserting a duplicate. Returns
    /// `NotFound` when neither the temporary nor the server entry exists.
    pub fn confirm_optimistic_message(&mut self, temp_id: &str, mut server: Message) -> ApplyOutcome {
        if let Some(conversation_id) = self.local_index.remove(temp_id) {
            let Some(thread) = self.threads.get_mut(&conversation_id) else {
                return ApplyOutcome::NotFound;
            };
            let Some(temp_idx) = thread.position(temp_id) else {
                return ApplyOutcome::NotFound;
            };
            conversation_id.clone_into(&mut server.conversation_id);

            if let Some(server_idx) = thread.position(&server.id) {
                thread.messages.remove(temp_idx);
                let server_idx = if temp_idx < server_idx { server_idx - 1 } else { server_idx };
                thread.retarget_summary(temp_id, &server);
                merge_into(thread, server_idx, server);
            } else {
                thread.messages[temp_idx] = Entry { message: server.clone(), origin: Origin::Server, prior_summary: None };
                thread.resort();
                thread.retarget_summary(temp_id, &server);
                thread.settle_summary();
            }
            self.dirty.insert(conversation_id);
            return ApplyOutcome::Updated;
        }

        if let Some((conversation_id, server_id)) = self.superseded.remove(temp_id) {
            if server.id != server_id {
                // The push that replaced the local entry was a different
                // message with the same content; ours still has to land.
                return self.insert_confirmed(&conversation_id, server);
            }
            return self.merge_existing(&conversation_id, server);
        }

        let conversation_id = server.conversation_id.clone();
        self.merge_existing(&conversation_id, server)
    }

    /// Remove an optimistic entry and restore the summary it displaced.
    pub fn rollback_optimistic_message(&mut self, temp_id: &str) -> ApplyOutcome {
        let Some(conversation_id) = self.local_index.remove(temp_id) else {
            self.superseded.remove(temp_id);
            return ApplyOutcome::NotFound;
        };
        let Some(thread) = self.threads.get_mut(&conversation_id) else {
            return ApplyOutcome::NotFound;
        };
        let Some(idx) = thread.position(temp_id) else {
            return ApplyOutcome::NotFound;
        };

        let entry = thread.messages.remove(idx);
        if let Some(conversation) = thread.conversation.as_mut()
            && conversation
                .last_message
                .as_ref()
                .is_some_and(|m| m.message_id.as_deref() == Some(temp_id))
        {
            conversation.last_message = entry.prior_summary;
        }
        thread.settle_summary();
        self.dirty.insert(conversation_id);
        ApplyOutcome::Removed
    }

    /// Insert a confirmed send without echo matching, or merge it when the
    /// server id is already cached. Never counts as unread.
    fn insert_confirmed(&mut self, conversation_id: &str, mut server: Message) -> ApplyOutcome {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return ApplyOutcome::NotFound;
        };
        if thread.position(&server.id).is_some() {
            return self.merge_existing(conversation_id, server);
        }
        conversation_id.clone_into(&mut server.conversation_id);
        thread.insert_sorted(Entry { message: server, origin: Origin::Server, prior_summary: None });
        thread.settle_summary();
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Inserted
    }

    /// Update an already cached message; never inserts.
    fn merge_existing(&mut self, conversation_id: &str, message: Message) -> ApplyOutcome {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return ApplyOutcome::NotFound;
        };
        let Some(idx) = thread.position(&message.id) else {
            return ApplyOutcome::NotFound;
        };
        let mut message = message;
        conversation_id.clone_into(&mut message.conversation_id);
        let outcome = merge_into(thread, idx, message);
        if outcome.changed() {
            self.dirty.insert(conversation_id.to_owned());
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// Apply a wholesale server conversation object.
    ///
    /// Unknown conversations are inserted. Known ones are replaced unless the
    /// incoming `updated_at` is older; the summary never regresses.
    pub fn apply_conversation(&mut self, incoming: Conversation) -> ApplyOutcome {
        let conversation_id = incoming.id.clone();
        let thread = self.threads.entry(conversation_id.clone()).or_default();

        let outcome = match thread.conversation.take() {
            None => {
                thread.conversation = Some(incoming);
                thread.settle_summary();
                ApplyOutcome::Inserted
            }
            Some(existing) if incoming.updated_at < existing.updated_at => {
                thread.conversation = Some(existing);
                ApplyOutcome::Stale
            }
            Some(existing) => {
                let mut next = incoming;
                let held_is_newer = match (&existing.last_message, &next.last_message) {
                    (Some(_), None) => true,
                    (Some(held), Some(offered)) => held.timestamp > offered.timestamp,
                    _ => false,
                };
                if held_is_newer {
                    next.last_message.clone_from(&existing.last_message);
                }
                thread.conversation = Some(next);
                thread.settle_summary();
                if thread.conversation.as_ref() == Some(&existing) {
                    ApplyOutcome::Unchanged
                } else {
                    ApplyOutcome::Updated
                }
            }
        };
        if outcome.changed() {
            self.dirty.insert(conversation_id);
        }
        outcome
    }

    /// Shallow-merge a patch into a known conversation.
    ///
    /// A patch older than the held `updated_at` is `Stale`. A patched summary
    /// is applied only when it is newer than the held one. Unknown
    /// conversations are not created from a patch.
    pub fn apply_conversation_update(&mut self, conversation_id: &str, patch: ConversationPatch) -> ApplyOutcome {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return ApplyOutcome::NotFound;
        };
        let Some(conversation) = thread.conversation.as_mut() else {
            return ApplyOutcome::NotFound;
        };
        if patch.updated_at < conversation.updated_at {
            return ApplyOutcome::Stale;
        }

        let before = conversation.clone();
        if let Some(customer) = patch.customer {
            conversation.customer = customer;
        }
        if let Some(status) = patch.status {
            conversation.status = status;
        }
        if let Some(assigned_to) = patch.assigned_to {
            conversation.assigned_to = assigned_to;
        }
        if let Some(unread_count) = patch.unread_count {
            conversation.unread_count = unread_count;
        }
        if let Some(summary) = patch.last_message
            && conversation
                .last_message
                .as_ref()
                .is_none_or(|held| summary.timestamp > held.timestamp)
        {
            conversation.last_message = Some(summary);
        }
        conversation.updated_at = patch.updated_at;
        thread.settle_summary();

        if thread.conversation.as_ref() == Some(&before) {
            return ApplyOutcome::Unchanged;
        }
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Updated
    }

    /// Merge a freshly fetched page without clobbering newer push-derived state.
    pub fn merge_page(&mut self, conversations: Vec<Conversation>) -> MergeReport {
        let mut report = MergeReport::default();
        for conversation in conversations {
            match self.apply_conversation(conversation) {
                ApplyOutcome::Inserted => report.inserted += 1,
                ApplyOutcome::Updated => report.updated += 1,
                ApplyOutcome::Stale => report.stale += 1,
                _ => report.unchanged += 1,
            }
        }
        report
    }

    /// Zero the unread counter ahead of the server. Returns the prior count,
    /// or `None` if the conversation is unknown.
    pub fn apply_optimistic_read(&mut self, conversation_id: &str) -> Option<u32> {
        let conversation = self
            .threads
            .get_mut(conversation_id)?
            .conversation
            .as_mut()?;
        let prior = conversation.unread_count;
        if prior != 0 {
            conversation.unread_count = 0;
            self.dirty.insert(conversation_id.to_owned());
        }
        Some(prior)
    }

    /// Undo [`apply_optimistic_read`](Self::apply_optimistic_read). Messages
    /// counted since the optimistic reset are kept on top of the prior count.
    pub fn rollback_optimistic_read(&mut self, conversation_id: &str, prior: u32) -> ApplyOutcome {
        let Some(conversation) = self
            .threads
            .get_mut(conversation_id)
            .and_then(|t| t.conversation.as_mut())
        else {
            return ApplyOutcome::NotFound;
        };
        if prior == 0 {
            return ApplyOutcome::Unchanged;
        }
        conversation.unread_count = conversation.unread_count.saturating_add(prior);
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Updated
    }

    /// Merge inbox-level counters (e.g. `unassigned`, `mine`).
    pub fn apply_counters(&mut self, counters: BTreeMap<String, i64>) -> ApplyOutcome {
        let mut changed = false;
        for (key, value) in counters {
            if self.counters.get(&key) != Some(&value) {
                self.counters.insert(key, value);
                changed = true;
            }
        }
        if !changed {
            return ApplyOutcome::Unchanged;
        }
        self.counters_dirty = true;
        ApplyOutcome::Updated
    }

    /// Drop a conversation and any optimistic bookkeeping pointing at it.
    pub fn forget_conversation(&mut self, conversation_id: &str) -> ApplyOutcome {
        if self.threads.remove(conversation_id).is_none() {
            return ApplyOutcome::NotFound;
        }
        self.local_index.retain(|_, conv| conv != conversation_id);
        self.superseded.retain(|_, (conv, _)| conv != conversation_id);
        self.dirty.insert(conversation_id.to_owned());
        ApplyOutcome::Removed
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.threads.get(conversation_id)?.conversation.as_ref()
    }

    /// Messages of a conversation, oldest first.
    #[must_use]
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.threads
            .get(conversation_id)
            .map(|t| t.messages.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        let thread = self.threads.get(conversation_id)?;
        thread.messages.get(thread.position(message_id)?).map(|e| &e.message)
    }

    /// Whether an optimistic entry is still awaiting confirmation, either as
    /// a local entry or as one a push superseded.
    #[must_use]
    pub fn has_pending(&self, temp_id: &str) -> bool {
        self.local_index.contains_key(temp_id) || self.superseded.contains_key(temp_id)
    }

    /// All known conversations, most recent activity first.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list = self
            .threads
            .values()
            .filter_map(|t| t.conversation.clone())
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()).then_with(|| a.id.cmp(&b.id)));
        list
    }

    #[must_use]
    pub fn counters(&self) -> &BTreeMap<String, i64> {
        &self.counters
    }

    #[must_use]
    pub fn snapshot(&self, conversation_id: &str) -> ConversationSnapshot {
        self.threads.get(conversation_id).map_or_else(
            || ConversationSnapshot {
                conversation_id: conversation_id.to_owned(),
                conversation: None,
                messages: Vec::new(),
                stale: false,
            },
            |t| t.snapshot(conversation_id),
        )
    }

    /// Drain the set of conversations changed since the previous call.
    pub fn take_dirty(&mut self) -> Vec<ConversationId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// Drain the counters-changed flag.
    pub fn take_counters_dirty(&mut self) -> bool {
        std::mem::take(&mut self.counters_dirty)
    }
}

/// Merge a server message into the entry at `idx`, keeping order and summary.
fn merge_into(thread: &mut Thread, idx: usize, message: Message) -> ApplyOutcome {
    let entry = &mut thread.messages[idx];
    let merged = merge_server_message(&entry.message, message);
    if entry.origin == Origin::Server && entry.message == merged {
        return ApplyOutcome::Unchanged;
    }
    entry.message = merged.clone();
    entry.origin = Origin::Server;
    entry.prior_summary = None;
    thread.resort();
    thread.retarget_summary(&merged.id, &merged);
    thread.settle_summary();
    ApplyOutcome::Updated
}
