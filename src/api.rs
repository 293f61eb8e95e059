//! Chat HTTP API: the outbound calls the sync core depends on.
//!
//! `ChatApi` is the seam the mutation pipeline and the client talk to;
//! `HttpChatApi` is a thin reqwest wrapper over the REST endpoints. Response
//! parsing lives in pure functions so it can be tested without a server.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::types::{Conversation, ConversationStatus, Message, MessageId, MessageKind};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The configured base URL cannot be used to build endpoint URLs.
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request never produced a response (DNS, connect, timeout).
    #[error("API request failed: {0}")]
    Request(String),

    /// The server answered with a non-success status.
    #[error("API response error: status {status}")]
    Status { status: u16, body: String },

    /// The response body could not be deserialized.
    #[error("API response parse failed: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether repeating the same call may succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 408 | 429 | 500..=599, .. })
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Body of a send-message request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendMessageBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Temporary id of the optimistic entry, echoed back in the push ack.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

/// Inbox query filters. Unset fields are omitted from the query string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationFilters {
    pub status: Option<ConversationStatus>,
    pub assigned_to: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ConversationFilters {
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = self.status {
            let status = match status {
                ConversationStatus::Active => "active",
                ConversationStatus::Closed => "closed",
                ConversationStatus::Archived => "archived",
            };
            pairs.push(("status", status.to_owned()));
        }
        if let Some(assigned_to) = &self.assigned_to {
            pairs.push(("assigned_to", assigned_to.clone()));
        }
        if let Some(search) = &self.search {
            pairs.push(("search", search.clone()));
        }
        if let Some(page) = self.page {
            pairs.push(("page", page.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

/// One page of the inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationPage {
    pub conversations: Vec<Conversation>,
    pub total: u64,
    pub has_more: bool,
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a message; returns the server's authoritative copy.
    async fn send_message(&self, conversation_id: &str, body: &SendMessageBody) -> Result<Message, ApiError>;

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), ApiError>;

    async fn get_conversations(&self, filters: &ConversationFilters) -> Result<ConversationPage, ApiError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpChatApi {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpChatApi {
    /// `base_url` is the API root, e.g. `https://console.example.com/api`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidBaseUrl`] for an unparseable or non-HTTP
    /// base, or [`ApiError::HttpClientBuild`] if the client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let base = Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base, token })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String, ApiError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), body: text });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, conversation_id: &str, body: &SendMessageBody) -> Result<Message, ApiError> {
        let url = self.endpoint(&["conversations", conversation_id, "messages"])?;
        let text = self.execute(self.http.post(url).json(body)).await?;
        let mut message = parse_message_response(&text)?;
        if message.conversation_id.is_empty() {
            conversation_id.clone_into(&mut message.conversation_id);
        }
        Ok(message)
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["conversations", conversation_id, "read"])?;
        self.execute(self.http.post(url)).await?;
        Ok(())
    }

    async fn get_conversations(&self, filters: &ConversationFilters) -> Result<ConversationPage, ApiError> {
        let mut url = self.endpoint(&["conversations"])?;
        let pairs = filters.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        let text = self.execute(self.http.get(url)).await?;
        parse_conversations_response(&text)
    }
}

// =============================================================================
// PARSING
// =============================================================================

#[derive(Deserialize)]
struct PageResponse {
    #[serde(alias = "data", alias = "items")]
    conversations: Vec<Conversation>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default, alias = "hasMore")]
    has_more: Option<bool>,
}

/// Parse a send-message response: the message itself, or wrapped in
/// `message` or `data`.
pub(crate) fn parse_message_response(json: &str) -> Result<Message, ApiError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| ApiError::Parse(e.to_string()))?;
    let inner = ["message", "data"]
        .iter()
        .find_map(|key| value.get(*key).filter(|v| v.is_object()))
        .unwrap_or(&value);
    serde_json::from_value(inner.clone()).map_err(|e| ApiError::Parse(e.to_string()))
}

/// Parse a conversation page. A missing `total` falls back to the page size.
pub(crate) fn parse_conversations_response(json: &str) -> Result<ConversationPage, ApiError> {
    let page: PageResponse = serde_json::from_str(json).map_err(|e| ApiError::Parse(e.to_string()))?;
    let total = page
        .total
        .unwrap_or_else(|| u64::try_from(page.conversations.len()).unwrap_or(u64::MAX));
    Ok(ConversationPage { total, has_more: page.has_more.unwrap_or(false), conversations: page.conversations })
}
