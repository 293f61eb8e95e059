//! Event dispatcher: raw push payloads in, typed domain events out.
//!
//! DESIGN
//! ======
//! `on_event` decodes the envelope (JSON text or protobuf binary), drops
//! duplicates by envelope id, and types the payload by its discriminator.
//! Anything unparseable is logged and yields `None`; nothing here panics or
//! returns an error across the boundary. Unknown discriminators are ignored
//! at debug level.
//!
//! Typed events fan out to registered [`EventHandler`]s. [`StoreHandler`]
//! applies them to the shared store.

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod dispatch_test;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use frames::PushFrame;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::state::SyncState;
use crate::store::ApplyOutcome;
use crate::types::{Conversation, ConversationId, ConversationPatch, Message, MessageId, number_as_i64};

/// Default number of envelope ids remembered for duplicate suppression.
pub const DEFAULT_DEDUPE_WINDOW: usize = 512;

/// One message as it came off the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawEvent {
    Text(String),
    Binary(Vec<u8>),
}

/// A push event with a typed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    Connected {
        scope_id: Option<String>,
    },
    MessageReceived {
        conversation: Conversation,
        message: Message,
    },
    /// Server acknowledgement of a send, echoing the client's temporary id.
    MessageSent {
        temp_id: Option<MessageId>,
        conversation_id: ConversationId,
        message: Message,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
        patch: ConversationPatch,
    },
    ScheduledMessageSent {
        scheduled_id: Option<String>,
        conversation_id: ConversationId,
        message: Message,
        conversation: Option<Conversation>,
    },
    CountersUpdated {
        counters: BTreeMap<String, i64>,
    },
    TransportError {
        message: String,
    },
    Closed {
        code: Option<i64>,
        reason: Option<String>,
    },
}

impl DomainEvent {
    /// Event discriminator as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::MessageReceived { .. } => "messageReceived",
            Self::MessageSent { .. } => "messageSent",
            Self::ConversationUpdated { .. } => "conversationUpdated",
            Self::ScheduledMessageSent { .. } => "scheduledMessageSent",
            Self::CountersUpdated { .. } => "countersUpdated",
            Self::TransportError { .. } => "error",
            Self::Closed { .. } => "close",
        }
    }
}

/// Consumer of typed events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent);
}

// =============================================================================
// DISPATCHER
// =============================================================================

pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    window: usize,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_WINDOW)
    }
}

impl EventDispatcher {
    /// `window` bounds how many envelope ids are remembered; zero disables
    /// duplicate suppression.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self { handlers: Vec::new(), window, seen_order: VecDeque::new(), seen: HashSet::new() }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Type one raw event. `None` for duplicates, unknown kinds, and
    /// malformed payloads.
    pub fn on_event(&mut self, raw: &RawEvent) -> Option<DomainEvent> {
        let decoded = match raw {
            RawEvent::Text(text) => frames::decode_text(text),
            RawEvent::Binary(bytes) => frames::decode_frame(bytes),
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable push event");
                return None;
            }
        };

        if let Some(id) = &frame.id
            && !self.remember(id)
        {
            tracing::debug!(id = %id, kind = %frame.kind, "dropping duplicate push event");
            return None;
        }

        parse_frame(frame)
    }

    /// Type a raw event and hand it to every registered handler.
    pub fn dispatch(&mut self, raw: &RawEvent) -> Option<DomainEvent> {
        let event = self.on_event(raw)?;
        for handler in &self.handlers {
            handler.handle(&event);
        }
        Some(event)
    }

    /// Record an envelope id. Returns false if it was already seen.
    fn remember(&mut self, id: &str) -> bool {
        if self.window == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.seen_order.len() >= self.window
            && let Some(oldest) = self.seen_order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.seen_order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn parse_frame(frame: PushFrame) -> Option<DomainEvent> {
    let PushFrame { ts, scope_id, kind, data, .. } = frame;
    match kind.as_str() {
        "connected" => Some(DomainEvent::Connected {
            scope_id: scope_id.or_else(|| string_field(&data, &["scope_id", "scopeId"])),
        }),
        "messageReceived" => parse_message_received(&data),
        "messageSent" => parse_message_sent(&data),
        "conversationUpdated" => parse_conversation_updated(&data, ts),
        "scheduledMessageSent" => parse_scheduled_message_sent(&data),
        "countersUpdated" => Some(parse_counters(&data)),
        "error" => Some(DomainEvent::TransportError {
            message: string_field(&data, &["message", "error"]).unwrap_or_else(|| "unknown error".to_owned()),
        }),
        "close" => Some(DomainEvent::Closed {
            code: data.get("code").and_then(number_as_i64),
            reason: string_field(&data, &["reason"]),
        }),
        other => {
            tracing::debug!(kind = %other, "ignoring unknown push event");
            None
        }
    }
}

fn parse_message_received(data: &Value) -> Option<DomainEvent> {
    let conversation = required::<Conversation>(data, "conversation", "messageReceived")?;
    let mut message = required::<Message>(data, "message", "messageReceived")?;
    message.conversation_id.clone_from(&conversation.id);
    Some(DomainEvent::MessageReceived { conversation, message })
}

fn parse_message_sent(data: &Value) -> Option<DomainEvent> {
    let Some(conversation_id) = conversation_id_of(data) else {
        tracing::warn!(kind = "messageSent", "dropping event without conversation id");
        return None;
    };
    let mut message = required::<Message>(data, "message", "messageSent")?;
    message.conversation_id.clone_from(&conversation_id);
    let temp_id = string_field(data, &["temp_id", "tempId", "client_id", "clientId"]);
    Some(DomainEvent::MessageSent { temp_id, conversation_id, message })
}

fn parse_conversation_updated(data: &Value, ts: i64) -> Option<DomainEvent> {
    let Some(conversation_id) = conversation_id_of(data) else {
        tracing::warn!(kind = "conversationUpdated", "dropping event without conversation id");
        return None;
    };
    let mut fields = match data.get("conversation").or_else(|| data.get("patch")) {
        Some(Value::Object(fields)) => fields.clone(),
        _ => data.as_object().cloned().unwrap_or_else(Map::new),
    };
    if !fields.contains_key("updated_at") && !fields.contains_key("updatedAt") && ts != 0 {
        fields.insert("updated_at".into(), Value::from(ts));
    }
    match serde_json::from_value::<ConversationPatch>(Value::Object(fields)) {
        Ok(patch) => Some(DomainEvent::ConversationUpdated { conversation_id, patch }),
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "dropping malformed conversation patch");
            None
        }
    }
}

fn parse_scheduled_message_sent(data: &Value) -> Option<DomainEvent> {
    let Some(conversation_id) = conversation_id_of(data) else {
        tracing::warn!(kind = "scheduledMessageSent", "dropping event without conversation id");
        return None;
    };
    let mut message = required::<Message>(data, "message", "scheduledMessageSent")?;
    message.conversation_id.clone_from(&conversation_id);
    let conversation = data
        .get("conversation")
        .and_then(|v| serde_json::from_value::<Conversation>(v.clone()).ok())
        .filter(|c| c.id == conversation_id);
    let scheduled_id = string_field(data, &["scheduled_id", "scheduledId", "scheduled_message_id"]);
    Some(DomainEvent::ScheduledMessageSent { scheduled_id, conversation_id, message, conversation })
}

fn parse_counters(data: &Value) -> DomainEvent {
    let source = data.get("counters").filter(|v| v.is_object()).unwrap_or(data);
    let counters = source
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| number_as_i64(v).map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default();
    DomainEvent::CountersUpdated { counters }
}

/// Deserialize a required nested object, logging why it is missing or bad.
fn required<T: DeserializeOwned>(data: &Value, key: &str, kind: &str) -> Option<T> {
    let Some(value) = data.get(key).filter(|v| v.is_object()) else {
        tracing::warn!(kind = %kind, field = %key, "dropping event with missing field");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(kind = %kind, field = %key, error = %e, "dropping event with malformed field");
            None
        }
    }
}

/// Conversation id from the payload, the nested conversation, or the nested message.
fn conversation_id_of(data: &Value) -> Option<ConversationId> {
    string_field(data, &["conversation_id", "conversationId"])
        .or_else(|| data.get("conversation").and_then(|c| string_field(c, &["id"])))
        .or_else(|| {
            data.get("message")
                .and_then(|m| string_field(m, &["conversation_id", "conversationId"]))
        })
        .filter(|id| !id.is_empty())
}

/// First present key as a string; numeric values are stringified.
fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

// =============================================================================
// STORE HANDLER
// =============================================================================

/// Applies push events to the shared store.
pub struct StoreHandler {
    state: SyncState,
}

impl StoreHandler {
    #[must_use]
    pub fn new(state: SyncState) -> Self {
        Self { state }
    }
}

impl EventHandler for StoreHandler {
    fn handle(&self, event: &DomainEvent) {
        let outcome = match event {
            // The pushed conversation already counts this message, so it is
            // applied after the message and its unread count wins.
            DomainEvent::MessageReceived { conversation, message } => self.state.mutate(|store| {
                let outcome = store.apply_server_message(&conversation.id, message.clone());
                store.apply_conversation(conversation.clone());
                outcome
            }),
            DomainEvent::MessageSent { temp_id, conversation_id, message } => self.state.mutate(|store| match temp_id {
                Some(temp_id) if store.has_pending(temp_id) => {
                    store.confirm_optimistic_message(temp_id, message.clone())
                }
                _ => store.apply_server_message(conversation_id, message.clone()),
            }),
            DomainEvent::ConversationUpdated { conversation_id, patch } => self
                .state
                .mutate(|store| store.apply_conversation_update(conversation_id, patch.clone())),
            DomainEvent::ScheduledMessageSent { conversation_id, message, conversation, .. } => {
                self.state.mutate(|store| {
                    let outcome = store.apply_server_message(conversation_id, message.clone());
                    if let Some(conversation) = conversation {
                        store.apply_conversation(conversation.clone());
                    }
                    outcome
                })
            }
            DomainEvent::CountersUpdated { counters } => self
                .state
                .mutate(|store| store.apply_counters(counters.clone())),
            DomainEvent::Connected { .. } | DomainEvent::TransportError { .. } | DomainEvent::Closed { .. } => {
                return;
            }
        };

        if outcome == ApplyOutcome::Stale || outcome == ApplyOutcome::NotFound {
            tracing::debug!(kind = event.kind(), ?outcome, "push event left store unchanged");
        }
    }
}
