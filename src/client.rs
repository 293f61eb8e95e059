//! Sync engine: wires store, hub, dispatcher, pipeline, and connections.
//!
//! DESIGN
//! ======
//! Push events flow connection -> dispatcher -> store -> subscribers. The
//! connection manager talks to a [`ClientSink`], which decodes raw events
//! through the shared dispatcher and mirrors connection state into
//! [`SyncState`] so views see `stale` flip and exhaustion surface.
//!
//! Events missed while disconnected are not replayed by the server. On every
//! re-open the sink refetches the first inbox page and merges it; the store's
//! timestamp gating keeps that merge from regressing newer pushed data.
//!
//! Lock order: dispatcher -> store -> delivery.

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;

use std::sync::{Arc, Mutex, PoisonError};

use crate::api::{ApiError, ChatApi, ConversationFilters, ConversationPage, HttpChatApi};
use crate::config::SyncConfig;
use crate::connection::{BackoffPolicy, ConnectionHandle, ConnectionManager, ConnectionSnapshot, Connector, EventSink};
use crate::dispatch::{EventDispatcher, EventHandler, RawEvent, StoreHandler};
use crate::mutation::{Draft, MutationError, MutationPipeline};
use crate::state::SyncState;
use crate::store::MergeReport;
use crate::transport::{TransportError, WsConnector};
use crate::types::Message;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// SINK
// =============================================================================

/// Connection-side entry point into the engine.
pub struct ClientSink {
    state: SyncState,
    api: Arc<dyn ChatApi>,
    dispatcher: Arc<Mutex<EventDispatcher>>,
}

impl EventSink for ClientSink {
    fn on_raw(&self, scope_id: &str, event: RawEvent) {
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(event) = dispatcher.dispatch(&event) {
            tracing::trace!(scope = %scope_id, kind = event.kind(), "push event applied");
        }
    }

    fn on_state(&self, snapshot: &ConnectionSnapshot) {
        self.state.set_connection(snapshot.clone());
    }

    fn on_open(&self, scope_id: &str, reconnected: bool) {
        if !reconnected {
            return;
        }
        let state = self.state.clone();
        let api = Arc::clone(&self.api);
        let scope_id = scope_id.to_owned();
        tokio::spawn(async move {
            match resync_on_reconnect(&state, api.as_ref()).await {
                Ok(report) => tracing::info!(scope = %scope_id, ?report, "resynced after reconnect"),
                Err(e) => tracing::warn!(scope = %scope_id, error = %e, "resync after reconnect failed"),
            }
        });
    }
}

/// Refetch the first inbox page and merge it into the store.
///
/// # Errors
///
/// Returns the [`ApiError`] of the fetch; the store is left untouched.
pub async fn resync_on_reconnect(state: &SyncState, api: &dyn ChatApi) -> Result<MergeReport, ApiError> {
    let page = api.get_conversations(&ConversationFilters::default()).await?;
    Ok(state.mutate(|store| store.merge_page(page.conversations)))
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct SyncClient {
    state: SyncState,
    api: Arc<dyn ChatApi>,
    dispatcher: Arc<Mutex<EventDispatcher>>,
    pipeline: Arc<MutationPipeline>,
    connections: ConnectionManager,
}

impl SyncClient {
    /// Client over HTTP and websocket, configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if `config.base_url` is not a usable HTTP
    /// origin or the HTTP client cannot be built.
    pub fn new(config: &SyncConfig) -> Result<Self, ClientError> {
        let api = Arc::new(HttpChatApi::new(&config.api_base(), config.token.clone())?);
        let connector = Arc::new(WsConnector::new(&config.base_url, config.token.clone())?);
        Ok(Self::from_parts(api, connector, config.backoff, config.dedupe_window))
    }

    /// Client over arbitrary collaborators.
    #[must_use]
    pub fn from_parts(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        backoff: BackoffPolicy,
        dedupe_window: usize,
    ) -> Self {
        let state = SyncState::new();
        let mut dispatcher = EventDispatcher::new(dedupe_window);
        dispatcher.register(Arc::new(StoreHandler::new(state.clone())));
        let dispatcher = Arc::new(Mutex::new(dispatcher));

        let sink = Arc::new(ClientSink {
            state: state.clone(),
            api: Arc::clone(&api),
            dispatcher: Arc::clone(&dispatcher),
        });
        let pipeline = Arc::new(MutationPipeline::new(state.clone(), Arc::clone(&api)));
        let connections = ConnectionManager::new(connector, sink, backoff);

        Self { state, api, dispatcher, pipeline, connections }
    }

    #[must_use]
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<MutationPipeline> {
        &self.pipeline
    }

    /// Add a handler that sees every typed push event after the store does.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(handler);
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Open the push connection for `scope_id`. Must be called inside a
    /// tokio runtime.
    pub fn connect(&self, scope_id: &str) -> ConnectionHandle {
        tracing::info!(scope = %scope_id, "connecting");
        self.connections.connect(scope_id)
    }

    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        self.connections.disconnect(handle)
    }

    pub fn reconnect(&self, handle: &ConnectionHandle) -> bool {
        self.connections.reconnect(handle)
    }

    #[must_use]
    pub fn connection(&self, handle: &ConnectionHandle) -> Option<ConnectionSnapshot> {
        self.connections.snapshot(handle)
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    /// Fetch one inbox page and merge it into the store.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the fetch.
    pub async fn load_conversations(&self, filters: &ConversationFilters) -> Result<ConversationPage, ApiError> {
        let page = self.api.get_conversations(filters).await?;
        let report = self
            .state
            .mutate(|store| store.merge_page(page.conversations.clone()));
        tracing::debug!(?report, total = page.total, has_more = page.has_more, "conversation page merged");
        Ok(page)
    }

    /// See [`MutationPipeline::send_message`].
    ///
    /// # Errors
    ///
    /// Returns whatever the pipeline returns.
    pub async fn send_message(&self, conversation_id: &str, draft: Draft) -> Result<Message, MutationError> {
        self.pipeline.send_message(conversation_id, draft).await
    }

    /// See [`MutationPipeline::mark_read`].
    ///
    /// # Errors
    ///
    /// Returns whatever the pipeline returns.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<bool, MutationError> {
        self.pipeline.mark_read(conversation_id).await
    }

    /// Drop a conversation the view no longer shows, cancelling its pending
    /// mutations first.
    pub fn close_conversation(&self, conversation_id: &str) {
        let cancelled = self.pipeline.cancel_conversation(conversation_id);
        self.state.mutate(|store| store.forget_conversation(conversation_id));
        tracing::debug!(conversation_id = %conversation_id, cancelled, "conversation closed");
    }
}
