//! Conversation and message model shared by the store, dispatcher, and API.
//!
//! DESIGN
//! ======
//! These types mirror server payloads so serde round-trips stay lossless.
//! Identifiers are plain strings: temporary ids (`local-...`) and server ids
//! share one key space inside a conversation's thread. Timestamps are
//! milliseconds since the Unix epoch.
//!
//! Push payloads reach us either as JSON text or through the protobuf path,
//! which turns every integer into a float; numeric fields therefore accept
//! any integer-compatible number.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub type ConversationId = String;
pub type MessageId = String;

// =============================================================================
// ENUMS
// =============================================================================

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// The end customer on the other side of the channel.
    Customer,
    /// An automated flow or bot reply.
    Bot,
    /// A human support agent using the console.
    #[serde(alias = "agent", alias = "user")]
    Human,
}

/// Delivery status of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Local optimistic entry; the send request is in flight.
    Sending,
    /// Accepted by the server.
    #[default]
    Sent,
    /// Delivered to the customer's device.
    Delivered,
    /// Read by the customer.
    Read,
    /// Rejected by the server or the channel.
    Failed,
}

impl MessageStatus {
    /// Progress rank used to keep delivery status from moving backwards.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }
}

/// Content type of a message. Unknown server values map to `Other`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Audio,
    Image,
    Video,
    Document,
    Template,
    #[serde(other)]
    Other,
}

/// Lifecycle status of a conversation. Conversations are archived, never deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    #[serde(alias = "open")]
    Active,
    Closed,
    Archived,
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A single chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id, or a temporary `local-...` id before confirmation.
    pub id: MessageId,
    /// Owning conversation. Push payloads may omit it; the dispatcher fills it in.
    #[serde(default, alias = "conversationId")]
    pub conversation_id: ConversationId,
    #[serde(alias = "sender_type", alias = "senderType")]
    pub sender: SenderKind,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(
        alias = "created_at",
        alias = "createdAt",
        deserialize_with = "deserialize_i64_from_number"
    )]
    pub timestamp: i64,
    /// Message this one replies to, if any.
    #[serde(default, alias = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

// =============================================================================
// CONVERSATION
// =============================================================================

/// The customer a conversation is held with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Summary of the newest known message in a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    /// Message the summary was taken from. Server summaries may omit it.
    #[serde(default, alias = "id", alias = "messageId")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub content: String,
    #[serde(
        alias = "created_at",
        alias = "createdAt",
        deserialize_with = "deserialize_i64_from_number"
    )]
    pub timestamp: i64,
    #[serde(alias = "sender_type", alias = "senderType")]
    pub sender: SenderKind,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_id: Some(message.id.clone()),
            content: message.content.clone(),
            timestamp: message.timestamp,
            sender: message.sender,
        }
    }
}

/// A support conversation as held in the local cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default, alias = "contact")]
    pub customer: Customer,
    #[serde(default)]
    pub status: ConversationStatus,
    /// Agent the conversation is assigned to; `None` when unassigned.
    #[serde(default, alias = "assignedTo")]
    pub assigned_to: Option<String>,
    #[serde(default, alias = "lastMessage")]
    pub last_message: Option<LastMessage>,
    #[serde(
        default,
        alias = "unreadCount",
        deserialize_with = "deserialize_u32_from_number"
    )]
    pub unread_count: u32,
    #[serde(
        alias = "updatedAt",
        deserialize_with = "deserialize_i64_from_number"
    )]
    pub updated_at: i64,
}

impl Conversation {
    /// Most recent activity, used to order the inbox.
    #[must_use]
    pub fn activity_at(&self) -> i64 {
        self.last_message
            .as_ref()
            .map_or(self.updated_at, |m| m.timestamp.max(self.updated_at))
    }
}

/// Partial conversation update. Only `updated_at` is required.
///
/// `assigned_to` distinguishes an absent key (`None`) from an explicit
/// `null` (`Some(None)`, i.e. unassign).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, alias = "contact", skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(
        default,
        alias = "assignedTo",
        deserialize_with = "deserialize_explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_to: Option<Option<String>>,
    #[serde(default, alias = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(
        default,
        alias = "unreadCount",
        deserialize_with = "deserialize_optional_u32_from_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub unread_count: Option<u32>,
    #[serde(
        alias = "updatedAt",
        deserialize_with = "deserialize_i64_from_number"
    )]
    pub updated_at: i64,
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

fn deserialize_explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

fn deserialize_u32_from_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_optional_u32_from_number(deserializer).map(Option::unwrap_or_default)
}

fn deserialize_optional_u32_from_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    let number = number_as_i64(&value).ok_or_else(|| D::Error::custom("expected integer-compatible number"))?;
    u32::try_from(number)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("value {number} out of range for u32")))
}

fn deserialize_i64_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    number_as_i64(&value).ok_or_else(|| D::Error::custom("expected integer-compatible number"))
}

/// Read an integer from a JSON number, accepting integral floats.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn number_as_i64(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .filter(|v| (i64::MIN as f64..=i64::MAX as f64).contains(v))
            .map(|v| v as i64)
    })
}
