//! Real-time conversation and message synchronization for a support console.
//!
//! DESIGN
//! ======
//! A local cache of conversations and messages is kept consistent with a
//! server that pushes updates over a live event stream, while local optimistic
//! actions (send message, mark read) mutate the same cache and are reconciled
//! against server-confirmed results.
//!
//! - `connection`: one supervised push transport per scope, with backoff
//! - `dispatch`: raw push events to typed domain events, de-duplicated
//! - `store`: the reconciliation store, the single source of truth
//! - `mutation`: optimistic sends and read markers
//! - `subscription` / `state`: change notification for views
//! - `client`: the engine wiring all of the above together
//!
//! `api` and `transport` hold the HTTP and websocket implementations of the
//! external collaborators.

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod mutation;
pub mod state;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod types;

pub use client::{ClientError, SyncClient};
pub use config::SyncConfig;
pub use connection::{BackoffPolicy, ConnectionHandle, ConnectionSnapshot, ConnectionState};
pub use dispatch::{DomainEvent, RawEvent};
pub use mutation::{Draft, MutationError, MutationState};
pub use state::SyncState;
pub use store::{ApplyOutcome, ConversationSnapshot, ConversationStore};
pub use subscription::Subscription;
pub use types::{Conversation, ConversationPatch, Message, MessageStatus};
