//! Connection manager: one live push transport per scope, with backoff.
//!
//! DESIGN
//! ======
//! Each `connect` spawns a supervisor task that opens a transport, pumps raw
//! events into the [`EventSink`], and on error or close schedules a retry
//! after `min(base_delay * 2^attempts, max_delay)`. After `max_attempts`
//! consecutive failures the task parks in a terminal `Closed` state with
//! `exhausted` set, until a manual [`ConnectionManager::reconnect`].
//!
//! A manual reconnect resets the attempt counter and retries immediately,
//! whether the task is sleeping in backoff, parked, or holding an open
//! transport. Requests bump a generation counter on a `watch` channel; the
//! supervisor marks the generation seen whenever an open succeeds, so a
//! request that arrives while an open is in flight is answered by that open
//! rather than by restarting the fresh session.
//!
//! State changes are published twice: to the sink (which feeds the
//! subscription hub) and to a `watch` channel read by
//! [`ConnectionManager::snapshot`].

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatch::RawEvent;
use crate::transport::TransportError;

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential backoff between reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures before the connection gives up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows `attempts` prior failures.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Point-in-time view of one scope's connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub scope_id: String,
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub attempts: u32,
    /// Milliseconds since the Unix epoch of the last received event.
    pub last_event_at: Option<i64>,
    /// Backoff delay currently being waited out.
    pub retry_in: Option<Duration>,
    /// Reconnect attempts ran out; only a manual reconnect resumes.
    pub exhausted: bool,
}

impl ConnectionSnapshot {
    #[must_use]
    pub fn new(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_owned(),
            state: ConnectionState::Connecting,
            attempts: 0,
            last_event_at: None,
            retry_in: None,
            exhausted: false,
        }
    }
}

/// Identifies one `connect` call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub scope_id: String,
}

// =============================================================================
// TRAITS
// =============================================================================

/// An open push channel.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Next raw event; `None` once the peer closed the channel.
    async fn next_event(&mut self) -> Option<Result<RawEvent, TransportError>>;

    /// Close the channel politely. Dropping a transport also closes it.
    async fn close(&mut self) {}
}

/// Opens transports for a scope.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the channel cannot be opened.
    async fn open(&self, scope_id: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Receives everything a connection produces.
pub trait EventSink: Send + Sync {
    /// A raw event arrived on `scope_id`.
    fn on_raw(&self, scope_id: &str, event: RawEvent);

    /// The connection state changed.
    fn on_state(&self, snapshot: &ConnectionSnapshot);

    /// A transport opened. `reconnected` is true when an earlier session on
    /// the same handle had been open.
    fn on_open(&self, _scope_id: &str, _reconnected: bool) {}
}

// =============================================================================
// MANAGER
// =============================================================================

struct Slot {
    handle: ConnectionHandle,
    /// Manual reconnect generation.
    wake: watch::Sender<u64>,
    task: JoinHandle<()>,
    state: watch::Receiver<ConnectionSnapshot>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    policy: BackoffPolicy,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn EventSink>, policy: BackoffPolicy) -> Self {
        Self { connector, sink, policy, slots: Mutex::new(HashMap::new()) }
    }

    /// Start a supervised connection for `scope_id`. Any earlier connection
    /// for the same scope is torn down first. Must be called inside a tokio
    /// runtime.
    pub fn connect(&self, scope_id: &str) -> ConnectionHandle {
        let handle = ConnectionHandle { id: Uuid::new_v4(), scope_id: scope_id.to_owned() };
        let (wake, wake_rx) = watch::channel(0_u64);
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::new(scope_id));

        let supervisor = Supervisor {
            scope_id: scope_id.to_owned(),
            connector: Arc::clone(&self.connector),
            sink: Arc::clone(&self.sink),
            policy: self.policy,
            wake: wake_rx,
            state: state_tx,
        };

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slots.remove(scope_id) {
            tracing::info!(scope = %scope_id, "replacing existing connection");
            previous.task.abort();
        }
        let task = tokio::spawn(supervisor.run());
        slots.insert(scope_id.to_owned(), Slot { handle: handle.clone(), wake, task, state: state_rx });
        handle
    }

    /// Tear down the connection. Returns false if `handle` is no longer live.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let live = slots
                .get(&handle.scope_id)
                .is_some_and(|slot| slot.handle == *handle);
            if live { slots.remove(&handle.scope_id) } else { None }
        };
        let Some(slot) = slot else {
            return false;
        };
        slot.task.abort();

        let mut closed = slot.state.borrow().clone();
        closed.state = ConnectionState::Closed;
        closed.retry_in = None;
        tracing::info!(scope = %handle.scope_id, "connection closed");
        self.sink.on_state(&closed);
        true
    }

    /// Reset the attempt counter and retry now. Returns false if `handle` is
    /// no longer live.
    pub fn reconnect(&self, handle: &ConnectionHandle) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&handle.scope_id) {
            Some(slot) if slot.handle == *handle => {
                slot.wake.send_modify(|generation| *generation += 1);
                true
            }
            _ => false,
        }
    }

    /// Latest state of a live connection.
    #[must_use]
    pub fn snapshot(&self, handle: &ConnectionHandle) -> Option<ConnectionSnapshot> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&handle.scope_id)
            .filter(|slot| slot.handle == *handle)
            .map(|slot| slot.state.borrow().clone())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in slots.drain() {
            slot.task.abort();
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

enum SessionEnd {
    /// Manual reconnect requested while open.
    Restart,
    Dropped,
}

struct Supervisor {
    scope_id: String,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    policy: BackoffPolicy,
    wake: watch::Receiver<u64>,
    state: watch::Sender<ConnectionSnapshot>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut snapshot = ConnectionSnapshot::new(&self.scope_id);
        let mut sessions = 0_u32;

        loop {
            snapshot.state = if sessions == 0 && snapshot.attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            snapshot.retry_in = None;
            snapshot.exhausted = false;
            self.publish(&snapshot);

            match self.connector.open(&self.scope_id).await {
                Ok(mut transport) => {
                    self.wake.mark_unchanged();
                    let reconnected = sessions > 0;
                    sessions += 1;
                    snapshot.attempts = 0;
                    snapshot.state = ConnectionState::Open;
                    tracing::info!(scope = %self.scope_id, reconnected, "connection open");
                    self.publish(&snapshot);
                    self.sink.on_open(&self.scope_id, reconnected);

                    let end = self.pump(transport.as_mut(), &mut snapshot).await;
                    transport.close().await;
                    if matches!(end, SessionEnd::Restart) {
                        continue;
                    }
                }
                Err(e) => {
                    tracing::warn!(scope = %self.scope_id, attempt = snapshot.attempts + 1, error = %e, "connection failed");
                }
            }

            let delay = self.policy.delay_for(snapshot.attempts);
            snapshot.attempts += 1;

            if snapshot.attempts >= self.policy.max_attempts {
                snapshot.state = ConnectionState::Closed;
                snapshot.exhausted = true;
                tracing::warn!(scope = %self.scope_id, attempts = snapshot.attempts, "reconnect attempts exhausted");
                self.publish(&snapshot);
                if self.wake.changed().await.is_err() {
                    return;
                }
                snapshot.attempts = 0;
                continue;
            }

            snapshot.state = ConnectionState::Reconnecting;
            snapshot.retry_in = Some(delay);
            tracing::info!(scope = %self.scope_id, attempt = snapshot.attempts, delay = ?delay, "reconnecting");
            self.publish(&snapshot);

            tokio::select! {
                Ok(()) = self.wake.changed() => {
                    snapshot.attempts = 0;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&mut self, transport: &mut dyn Transport, snapshot: &mut ConnectionSnapshot) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                Ok(()) = self.wake.changed() => {
                    tracing::info!(scope = %self.scope_id, "manual reconnect");
                    return SessionEnd::Restart;
                }
                event = transport.next_event() => match event {
                    Some(Ok(raw)) => {
                        let at = now_ms();
                        snapshot.last_event_at = Some(at);
                        self.state.send_modify(|s| s.last_event_at = Some(at));
                        self.sink.on_raw(&self.scope_id, raw);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(scope = %self.scope_id, error = %e, "transport error");
                        return SessionEnd::Dropped;
                    }
                    None => {
                        tracing::info!(scope = %self.scope_id, "transport closed by peer");
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    fn publish(&self, snapshot: &ConnectionSnapshot) {
        self.state.send_replace(snapshot.clone());
        self.sink.on_state(snapshot);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
