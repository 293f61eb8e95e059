//! Subscription hub: per-view listeners over store and connection state.
//!
//! DESIGN
//! ======
//! Views register a callback and get back a [`Subscription`] handle. Each
//! registration carries a `Gate`: a delivery checks the active flag and
//! marks itself running under the gate lock, and `unsubscribe` clears the
//! flag then waits until no delivery is running on another thread. Once
//! `unsubscribe` (or drop) returns, the callback is never invoked again and
//! the hub holds no reference to it. A callback that unsubscribes itself does
//! not wait on its own delivery.
//!
//! Listeners are cloned out of the registry before delivery; the registry
//! lock is never held while a callback runs, so a callback may unsubscribe
//! itself or register new listeners.

#[cfg(test)]
#[path = "subscription_test.rs"]
mod subscription_test;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crate::connection::ConnectionSnapshot;
use crate::store::ConversationSnapshot;
use crate::types::{Conversation, ConversationId};

/// Callback invoked with each delivered value.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// GATE
// =============================================================================

#[derive(Default)]
struct GateState {
    closed: bool,
    /// Threads currently inside the listener.
    running: Vec<ThreadId>,
}

/// Serializes the active check of a delivery against `unsubscribe`.
#[derive(Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl Gate {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.lock().closed
    }

    /// Run `call` unless the gate is closed. Returns whether it ran.
    pub(crate) fn run(&self, call: impl FnOnce()) -> bool {
        let me = thread::current().id();
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.running.push(me);
        }
        let _leave = Leave { gate: self, thread: me };
        call();
        true
    }

    /// Close the gate and wait for deliveries running on other threads.
    fn close(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        state.closed = true;
        while state.running.iter().any(|thread| *thread != me) {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Clears a running marker, also when the listener panics.
struct Leave<'a> {
    gate: &'a Gate,
    thread: ThreadId,
}

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        if let Some(index) = state.running.iter().position(|thread| *thread == self.thread) {
            state.running.swap_remove(index);
        }
        drop(state);
        self.gate.idle.notify_all();
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Live registration. Dropping the handle unsubscribes.
pub struct Subscription {
    gate: Arc<Gate>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop deliveries and release the listener. Safe to call during a
    /// delivery; blocks while this listener is running on another thread.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    pub(crate) fn gate(&self) -> Arc<Gate> {
        Arc::clone(&self.gate)
    }

    fn release(&mut self) {
        self.gate.close();
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

struct Slot<T> {
    id: u64,
    /// Conversation filter; `None` for global topics.
    key: Option<ConversationId>,
    gate: Arc<Gate>,
    listener: Listener<T>,
}

struct Registry<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { slots: Mutex::new(Vec::new()) }
    }
}

impl<T> Registry<T> {
    fn insert(&self, id: u64, key: Option<ConversationId>, listener: Listener<T>) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Slot { id, key, gate: Arc::clone(&gate), listener });
        gate
    }

    fn remove(&self, id: u64) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != id);
    }

    fn listeners(&self, key: Option<&str>) -> Vec<(Arc<Gate>, Listener<T>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| key.is_none() || slot.key.as_deref() == key)
            .map(|slot| (Arc::clone(&slot.gate), Arc::clone(&slot.listener)))
            .collect()
    }

    fn keys(&self) -> Vec<ConversationId> {
        let mut keys = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|slot| slot.key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys.dedup();
        keys
    }

    fn is_empty(&self) -> bool {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    fn deliver(&self, key: Option<&str>, value: &T) -> usize {
        let mut delivered = 0;
        for (gate, listener) in self.listeners(key) {
            if gate.run(|| listener(value)) {
                delivered += 1;
            }
        }
        delivered
    }
}

// =============================================================================
// HUB
// =============================================================================

#[derive(Clone, Copy)]
enum Topic {
    Conversation,
    Inbox,
    Connection,
    Counters,
}

/// Registry of every live subscription, grouped by topic.
#[derive(Default)]
pub struct SubscriptionHub {
    next_id: AtomicU64,
    conversations: Registry<ConversationSnapshot>,
    inbox: Registry<Vec<Conversation>>,
    connection: Registry<ConnectionSnapshot>,
    counters: Registry<BTreeMap<String, i64>>,
}

impl SubscriptionHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register for snapshots of one conversation. No initial delivery; the
    /// caller delivers the current snapshot.
    pub fn register_conversation(
        self: &Arc<Self>,
        conversation_id: &str,
        listener: Listener<ConversationSnapshot>,
    ) -> Subscription {
        let id = self.next_id();
        let gate = self
            .conversations
            .insert(id, Some(conversation_id.to_owned()), listener);
        self.handle(id, Topic::Conversation, gate)
    }

    pub fn register_inbox(self: &Arc<Self>, listener: Listener<Vec<Conversation>>) -> Subscription {
        let id = self.next_id();
        let gate = self.inbox.insert(id, None, listener);
        self.handle(id, Topic::Inbox, gate)
    }

    pub fn register_connection(self: &Arc<Self>, listener: Listener<ConnectionSnapshot>) -> Subscription {
        let id = self.next_id();
        let gate = self.connection.insert(id, None, listener);
        self.handle(id, Topic::Connection, gate)
    }

    pub fn register_counters(self: &Arc<Self>, listener: Listener<BTreeMap<String, i64>>) -> Subscription {
        let id = self.next_id();
        let gate = self.counters.insert(id, None, listener);
        self.handle(id, Topic::Counters, gate)
    }

    /// Deliver to subscribers of `snapshot.conversation_id` only. Returns the
    /// number of listeners invoked.
    pub fn publish_conversation(&self, snapshot: &ConversationSnapshot) -> usize {
        self.conversations
            .deliver(Some(&snapshot.conversation_id), snapshot)
    }

    #[allow(clippy::ptr_arg)]
    pub fn publish_inbox(&self, conversations: &Vec<Conversation>) -> usize {
        self.inbox.deliver(None, conversations)
    }

    pub fn publish_connection(&self, snapshot: &ConnectionSnapshot) -> usize {
        self.connection.deliver(None, snapshot)
    }

    pub fn publish_counters(&self, counters: &BTreeMap<String, i64>) -> usize {
        self.counters.deliver(None, counters)
    }

    /// Conversations with at least one live subscriber.
    #[must_use]
    pub fn watched_conversations(&self) -> Vec<ConversationId> {
        self.conversations.keys()
    }

    #[must_use]
    pub fn has_inbox_listeners(&self) -> bool {
        !self.inbox.is_empty()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle(self: &Arc<Self>, id: u64, topic: Topic, gate: Arc<Gate>) -> Subscription {
        let hub: Weak<Self> = Arc::downgrade(self);
        let detach = move || {
            let Some(hub) = hub.upgrade() else {
                return;
            };
            match topic {
                Topic::Conversation => hub.conversations.remove(id),
                Topic::Inbox => hub.inbox.remove(id),
                Topic::Connection => hub.connection.remove(id),
                Topic::Counters => hub.counters.remove(id),
            }
        };
        Subscription { gate, detach: Some(Box::new(detach)) }
    }
}
