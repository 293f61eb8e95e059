//! Optimistic mutation pipeline: local-first sends and read markers.
//!
//! DESIGN
//! ======
//! Every mutation is keyed by `(EntityKind, id)` and moves
//! `Idle -> Pending -> {Confirmed | Failed}`. The optimistic change lands in
//! the store before the network call; the server result then confirms or
//! rolls it back. At most one mutation per key is in flight: a second send
//! with the same temporary id is rejected, a second mark-read for the same
//! conversation is coalesced into the one already running.
//!
//! Cancelling a mutation only suppresses how its result is applied; the
//! request itself keeps running. Confirm and rollback are additionally
//! guarded by an existence check, so a result never resurrects an entry that
//! was removed in the meantime.
//!
//! Failed sends are kept with their draft until retried or dismissed.

#[cfg(test)]
#[path = "mutation_test.rs"]
mod mutation_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::api::{ApiError, ChatApi, SendMessageBody};
use crate::state::SyncState;
use crate::store::ApplyOutcome;
use crate::types::{ConversationId, Message, MessageId, MessageKind, MessageStatus, SenderKind};

/// Prefix of client-generated temporary message ids.
pub const LOCAL_ID_PREFIX: &str = "local-";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Message,
    ReadMarker,
}

/// Observable state of one mutation key. `Confirmed` is transient: once the
/// server result is applied the key reads as `Idle` again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("{kind:?} mutation {id} is already pending")]
    AlreadyPending { kind: EntityKind, id: String },

    #[error("conversation {0} is not loaded")]
    UnknownConversation(ConversationId),

    #[error("no failed send with id {0}")]
    NotFailed(MessageId),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What the user composed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    /// Temporary id to use; generated when absent.
    pub temp_id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
}

impl Draft {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self { temp_id: None, content: content.into(), kind: MessageKind::Text, reply_to: None }
    }
}

/// A send the server rejected, kept so the view can show it and offer retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedSend {
    pub temp_id: MessageId,
    pub conversation_id: ConversationId,
    pub draft: Draft,
    pub error: ApiError,
}

type Key = (EntityKind, String);

struct InFlight {
    conversation_id: ConversationId,
    cancelled: bool,
}

// =============================================================================
// PIPELINE
// =============================================================================

pub struct MutationPipeline {
    state: SyncState,
    api: Arc<dyn ChatApi>,
    inflight: Mutex<HashMap<Key, InFlight>>,
    failed: Mutex<HashMap<MessageId, FailedSend>>,
}

impl MutationPipeline {
    pub fn new(state: SyncState, api: Arc<dyn ChatApi>) -> Self {
        Self { state, api, inflight: Mutex::new(HashMap::new()), failed: Mutex::new(HashMap::new()) }
    }

    /// Send a message optimistically.
    ///
    /// # Errors
    ///
    /// [`MutationError::AlreadyPending`] if a send with the same temporary id
    /// is in flight or already in the store; [`MutationError::Api`] if the
    /// server rejected it, after the optimistic entry was rolled back.
    pub async fn send_message(&self, conversation_id: &str, draft: Draft) -> Result<Message, MutationError> {
        let temp_id = draft
            .temp_id
            .clone()
            .unwrap_or_else(|| format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()));
        let guard = self.begin(EntityKind::Message, &temp_id, conversation_id)?;

        let local = Message {
            id: temp_id.clone(),
            conversation_id: conversation_id.to_owned(),
            sender: SenderKind::Human,
            content: draft.content.clone(),
            kind: draft.kind,
            status: MessageStatus::Sending,
            timestamp: now_ms(),
            reply_to: draft.reply_to.clone(),
        };
        let inserted = self
            .state
            .mutate(|store| store.apply_optimistic_message(conversation_id, local));
        if !inserted.changed() {
            return Err(MutationError::AlreadyPending { kind: EntityKind::Message, id: temp_id });
        }
        self.lock_failed().remove(&temp_id);
        tracing::debug!(conversation_id = %conversation_id, temp_id = %temp_id, "send pending");

        let body = SendMessageBody {
            content: draft.content.clone(),
            kind: draft.kind,
            reply_to: draft.reply_to.clone(),
            temp_id: Some(temp_id.clone()),
        };
        let result = self.api.send_message(conversation_id, &body).await;
        let cancelled = guard.finish();

        match result {
            Ok(server) => {
                if cancelled {
                    tracing::debug!(temp_id = %temp_id, "send confirmed after cancel; result not applied");
                } else {
                    let outcome = self.state.mutate(|store| {
                        store
                            .has_pending(&temp_id)
                            .then(|| store.confirm_optimistic_message(&temp_id, server.clone()))
                    });
                    tracing::debug!(temp_id = %temp_id, server_id = %server.id, ?outcome, "send confirmed");
                }
                Ok(server)
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, temp_id = %temp_id, error = %e, "send failed");
                if !cancelled {
                    let outcome = self.state.mutate(|store| {
                        store
                            .has_pending(&temp_id)
                            .then(|| store.rollback_optimistic_message(&temp_id))
                    });
                    if outcome == Some(ApplyOutcome::Removed) {
                        self.lock_failed().insert(
                            temp_id.clone(),
                            FailedSend {
                                temp_id,
                                conversation_id: conversation_id.to_owned(),
                                draft: Draft { temp_id: None, ..draft },
                                error: e.clone(),
                            },
                        );
                    }
                }
                Err(MutationError::Api(e))
            }
        }
    }

    /// Resend a failed message under its original temporary id.
    ///
    /// # Errors
    ///
    /// [`MutationError::NotFailed`] if `temp_id` is not a failed send, plus
    /// everything [`send_message`](Self::send_message) returns.
    pub async fn retry_send(&self, temp_id: &str) -> Result<Message, MutationError> {
        let Some(failed) = self.lock_failed().remove(temp_id) else {
            return Err(MutationError::NotFailed(temp_id.to_owned()));
        };
        let draft = Draft { temp_id: Some(failed.temp_id.clone()), ..failed.draft.clone() };
        let result = self.send_message(&failed.conversation_id, draft).await;
        if matches!(result, Err(MutationError::AlreadyPending { .. })) {
            self.lock_failed().insert(failed.temp_id.clone(), failed);
        }
        result
    }

    /// Forget a failed send. Returns false if there was none.
    pub fn dismiss_failed(&self, temp_id: &str) -> bool {
        self.lock_failed().remove(temp_id).is_some()
    }

    /// Failed sends, oldest conversation id first.
    #[must_use]
    pub fn failed_sends(&self) -> Vec<FailedSend> {
        let mut failed = self.lock_failed().values().cloned().collect::<Vec<_>>();
        failed.sort_by(|a, b| {
            a.conversation_id
                .cmp(&b.conversation_id)
                .then_with(|| a.temp_id.cmp(&b.temp_id))
        });
        failed
    }

    /// Zero the unread counter now and tell the server.
    ///
    /// Returns `Ok(false)` when a mark-read for the same conversation is
    /// already in flight and this call was coalesced into it.
    ///
    /// # Errors
    ///
    /// [`MutationError::UnknownConversation`] if the conversation is not in
    /// the store; [`MutationError::Api`] if the server rejected the call,
    /// after the unread counter was restored.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<bool, MutationError> {
        let guard = match self.begin(EntityKind::ReadMarker, conversation_id, conversation_id) {
            Ok(guard) => guard,
            Err(MutationError::AlreadyPending { .. }) => {
                tracing::debug!(conversation_id = %conversation_id, "mark read coalesced");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let Some(prior) = self
            .state
            .mutate(|store| store.apply_optimistic_read(conversation_id))
        else {
            return Err(MutationError::UnknownConversation(conversation_id.to_owned()));
        };

        let result = self.api.mark_conversation_read(conversation_id).await;
        let cancelled = guard.finish();

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "mark read failed");
                if !cancelled {
                    self.state
                        .mutate(|store| store.rollback_optimistic_read(conversation_id, prior));
                }
                Err(MutationError::Api(e))
            }
        }
    }

    /// Stop a pending send from touching the store when it completes.
    /// Returns false if nothing was pending under `temp_id`.
    pub fn cancel(&self, temp_id: &str) -> bool {
        let mut inflight = self.lock_inflight();
        match inflight.get_mut(&(EntityKind::Message, temp_id.to_owned())) {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Cancel every pending mutation for a conversation, e.g. on view
    /// teardown. Returns how many were cancelled.
    pub fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let mut inflight = self.lock_inflight();
        let mut cancelled = 0;
        for entry in inflight.values_mut() {
            if entry.conversation_id == conversation_id && !entry.cancelled {
                entry.cancelled = true;
                cancelled += 1;
            }
        }
        cancelled
    }

    #[must_use]
    pub fn state(&self, kind: EntityKind, id: &str) -> MutationState {
        if self.lock_inflight().contains_key(&(kind, id.to_owned())) {
            return MutationState::Pending;
        }
        if kind == EntityKind::Message && self.lock_failed().contains_key(id) {
            return MutationState::Failed;
        }
        MutationState::Idle
    }

    fn begin(&self, kind: EntityKind, id: &str, conversation_id: &str) -> Result<InFlightGuard<'_>, MutationError> {
        let key = (kind, id.to_owned());
        let mut inflight = self.lock_inflight();
        if inflight.contains_key(&key) {
            return Err(MutationError::AlreadyPending { kind, id: id.to_owned() });
        }
        inflight.insert(key.clone(), InFlight { conversation_id: conversation_id.to_owned(), cancelled: false });
        Ok(InFlightGuard { pipeline: self, key: Some(key) })
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<Key, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failed(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, FailedSend>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the in-flight key when the mutation settles or its future is dropped.
struct InFlightGuard<'a> {
    pipeline: &'a MutationPipeline,
    key: Option<Key>,
}

impl InFlightGuard<'_> {
    /// Release the key; returns whether the mutation was cancelled.
    fn finish(mut self) -> bool {
        self.release().is_some_and(|entry| entry.cancelled)
    }

    fn release(&mut self) -> Option<InFlight> {
        let key = self.key.take()?;
        self.pipeline.lock_inflight().remove(&key)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
