//! Shared sync state: one store, one subscription hub.
//!
//! DESIGN
//! ======
//! `SyncState` is cloned into every component that touches the cache: the
//! push handler, the mutation pipeline, and the view layer. Mutations go
//! through [`SyncState::mutate`], which runs the store operation under the
//! store lock, drains the dirty set, builds snapshots for watched
//! conversations, then delivers them after the store lock is released.
//!
//! Deliveries go through a FIFO queue. Work is enqueued while the store lock
//! is still held, so the queue order matches the order of store changes. The
//! caller that finds nobody draining drains the queue after releasing the
//! store lock; anyone else, including a listener calling back into
//! `SyncState`, only enqueues and returns. A listener therefore never sees an
//! older snapshot after a newer one, and re-entrant calls deliver right after
//! the current listener returns instead of blocking.

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::{ConnectionSnapshot, ConnectionState};
use crate::store::{ConversationSnapshot, ConversationStore};
use crate::subscription::{Subscription, SubscriptionHub};
use crate::types::Conversation;

/// Snapshots collected under the store lock, delivered after it is released.
#[derive(Default)]
struct Pending {
    conversations: Vec<ConversationSnapshot>,
    inbox: Option<Vec<Conversation>>,
    counters: Option<BTreeMap<String, i64>>,
}

enum Delivery {
    Batch(Pending),
    Connection(ConnectionSnapshot),
    /// Initial snapshot for a single new listener.
    Initial(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct DeliveryQueue {
    jobs: VecDeque<Delivery>,
    draining: bool,
}

/// Releases the drain token if a listener panics mid-drain.
struct Drainer<'a> {
    queue: &'a Mutex<DeliveryQueue>,
    armed: bool,
}

impl Drop for Drainer<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().unwrap_or_else(PoisonError::into_inner).draining = false;
        }
    }
}

#[derive(Clone)]
pub struct SyncState {
    store: Arc<Mutex<ConversationStore>>,
    hub: Arc<SubscriptionHub>,
    delivery: Arc<Mutex<DeliveryQueue>>,
    /// True while the live connection is not open.
    stale: Arc<AtomicBool>,
    connection: Arc<Mutex<Option<ConnectionSnapshot>>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(ConversationStore::new())),
            hub: SubscriptionHub::new(),
            delivery: Arc::default(),
            stale: Arc::new(AtomicBool::new(true)),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Run a store operation and deliver whatever it changed.
    pub fn mutate<R>(&self, op: impl FnOnce(&mut ConversationStore) -> R) -> R {
        let mut store = self.lock_store();
        let result = op(&mut store);
        let pending = self.collect(&mut store);
        self.enqueue([Delivery::Batch(pending)]);
        drop(store);
        self.drain();
        result
    }

    /// Read from the store without delivering anything.
    pub fn read<R>(&self, op: impl FnOnce(&ConversationStore) -> R) -> R {
        op(&self.lock_store())
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Watch one conversation. The current snapshot is delivered before this
    /// returns, then one delivery per visible change. Called from inside a
    /// listener, the initial snapshot follows once that listener returns.
    pub fn subscribe<F>(&self, conversation_id: &str, on_change: F) -> Subscription
    where
        F: Fn(&ConversationSnapshot) + Send + Sync + 'static,
    {
        let on_change = Arc::new(on_change);
        let store = self.lock_store();
        let subscription = self
            .hub
            .register_conversation(conversation_id, on_change.clone());
        let mut snapshot = store.snapshot(conversation_id);
        snapshot.stale = self.is_stale();
        self.enqueue_initial(&subscription, move || on_change(&snapshot));
        drop(store);
        self.drain();
        subscription
    }

    /// Watch the inbox list, most recent activity first.
    pub fn subscribe_conversations<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(&Vec<Conversation>) + Send + Sync + 'static,
    {
        let on_change = Arc::new(on_change);
        let store = self.lock_store();
        let subscription = self.hub.register_inbox(on_change.clone());
        let list = store.conversations();
        self.enqueue_initial(&subscription, move || on_change(&list));
        drop(store);
        self.drain();
        subscription
    }

    /// Watch connection state, including exhaustion of reconnect attempts.
    pub fn subscribe_connection<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    {
        let on_change = Arc::new(on_change);
        let store = self.lock_store();
        let subscription = self.hub.register_connection(on_change.clone());
        if let Some(current) = self.connection() {
            self.enqueue_initial(&subscription, move || on_change(&current));
        }
        drop(store);
        self.drain();
        subscription
    }

    /// Watch inbox-level counters.
    pub fn subscribe_counters<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(&BTreeMap<String, i64>) + Send + Sync + 'static,
    {
        let on_change = Arc::new(on_change);
        let store = self.lock_store();
        let subscription = self.hub.register_counters(on_change.clone());
        let counters = store.counters().clone();
        self.enqueue_initial(&subscription, move || on_change(&counters));
        drop(store);
        self.drain();
        subscription
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Record a connection snapshot. When the stale flag flips, every watched
    /// conversation is re-delivered with the new flag.
    pub fn set_connection(&self, snapshot: ConnectionSnapshot) {
        let stale = snapshot.state != ConnectionState::Open;
        let store = self.lock_store();
        let flipped = self.stale.swap(stale, Ordering::AcqRel) != stale;
        let mut pending = Pending::default();
        if flipped {
            for conversation_id in self.hub.watched_conversations() {
                let mut conversation = store.snapshot(&conversation_id);
                conversation.stale = stale;
                pending.conversations.push(conversation);
            }
        }
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.enqueue([Delivery::Connection(snapshot), Delivery::Batch(pending)]);
        drop(store);
        self.drain();
    }

    #[must_use]
    pub fn connection(&self) -> Option<ConnectionSnapshot> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_store(&self) -> MutexGuard<'_, ConversationStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn collect(&self, store: &mut ConversationStore) -> Pending {
        let dirty = store.take_dirty();
        let counters_dirty = store.take_counters_dirty();
        let stale = self.is_stale();

        let watched = self.hub.watched_conversations();
        let conversations = dirty
            .iter()
            .filter(|id| watched.binary_search(*id).is_ok())
            .map(|id| {
                let mut snapshot = store.snapshot(id);
                snapshot.stale = stale;
                snapshot
            })
            .collect();
        let inbox = (!dirty.is_empty() && self.hub.has_inbox_listeners()).then(|| store.conversations());
        let counters = counters_dirty.then(|| store.counters().clone());
        Pending { conversations, inbox, counters }
    }

    // -------------------------------------------------------------------------
    // Delivery queue
    // -------------------------------------------------------------------------

    fn lock_queue(&self) -> MutexGuard<'_, DeliveryQueue> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the store lock held.
    fn enqueue(&self, jobs: impl IntoIterator<Item = Delivery>) {
        self.lock_queue().jobs.extend(jobs);
    }

    fn enqueue_initial(&self, subscription: &Subscription, deliver: impl FnOnce() + Send + 'static) {
        let gate = subscription.gate();
        self.enqueue([Delivery::Initial(Box::new(move || {
            gate.run(deliver);
        }))]);
    }

    /// Deliver queued work unless another caller already is.
    fn drain(&self) {
        {
            let mut queue = self.lock_queue();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        let mut drainer = Drainer { queue: &self.delivery, armed: true };
        loop {
            let job = {
                let mut queue = self.lock_queue();
                let Some(job) = queue.jobs.pop_front() else {
                    queue.draining = false;
                    drainer.armed = false;
                    return;
                };
                job
            };
            match job {
                Delivery::Batch(pending) => self.deliver(pending),
                Delivery::Connection(snapshot) => {
                    self.hub.publish_connection(&snapshot);
                }
                Delivery::Initial(deliver) => deliver(),
            }
        }
    }

    fn deliver(&self, pending: Pending) {
        for snapshot in &pending.conversations {
            self.hub.publish_conversation(snapshot);
        }
        if let Some(inbox) = &pending.inbox {
            self.hub.publish_inbox(inbox);
        }
        if let Some(counters) = &pending.counters {
            self.hub.publish_counters(counters);
        }
    }
}
