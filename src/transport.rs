//! Websocket push transport over tokio-tungstenite.
//!
//! `WsConnector` turns the console's HTTP origin into the push endpoint
//! (`ws(s)://host/api/ws?scope=...`) and opens one socket per call. Text and
//! binary messages become [`RawEvent`]s; control frames are swallowed; a close
//! frame or end of stream ends the transport.

#[cfg(test)]
#[path = "transport_test.rs"]
mod transport_test;

use futures_util::StreamExt;
use reqwest::Url;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::connection::{Connector, Transport};
use crate::dispatch::RawEvent;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid push URL: {0}")]
    InvalidUrl(String),

    #[error("websocket connect failed: {0}")]
    Connect(Box<WsError>),

    /// The server answered the upgrade with a non-101 status.
    #[error("websocket upgrade rejected: status {0}")]
    Rejected(u16),

    #[error("websocket receive failed: {0}")]
    Receive(Box<WsError>),
}

// =============================================================================
// CONNECTOR
// =============================================================================

pub struct WsConnector {
    origin: Url,
    token: Option<String>,
}

impl WsConnector {
    /// `origin` is the console's HTTP origin, e.g. `https://console.example.com`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] unless `origin` is an absolute
    /// `http` or `https` URL.
    pub fn new(origin: &str, token: Option<String>) -> Result<Self, TransportError> {
        let parsed = Url::parse(origin).map_err(|e| TransportError::InvalidUrl(format!("{origin}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(origin.to_owned()));
        }
        Ok(Self { origin: parsed, token })
    }

    /// Push endpoint for `scope_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the scheme cannot be switched.
    pub fn push_url(&self, scope_id: &str) -> Result<Url, TransportError> {
        let mut url = self.origin.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(self.origin.to_string()))?;
        let path = format!("{}/api/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("scope", scope_id);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, scope_id: &str) -> Result<Box<dyn Transport>, TransportError> {
        let url = self.push_url(scope_id)?;
        let (stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
            WsError::Http(response) => TransportError::Rejected(response.status().as_u16()),
            other => TransportError::Connect(Box::new(other)),
        })?;
        tracing::debug!(scope = %scope_id, "websocket open");
        Ok(Box::new(WsTransport { stream, closed: false }))
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

pub struct WsTransport {
    stream: WsStream,
    closed: bool,
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn next_event(&mut self) -> Option<Result<RawEvent, TransportError>> {
        if self.closed {
            return None;
        }
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    self.closed = true;
                    return None;
                }
                Err(e) => return Some(Err(TransportError::Receive(Box::new(e)))),
            };
            match message {
                Message::Text(text) => return Some(Ok(RawEvent::Text(text.as_str().to_owned()))),
                Message::Binary(bytes) => return Some(Ok(RawEvent::Binary(bytes.to_vec()))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "websocket close frame");
                    self.closed = true;
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }
}
