//! MCP transport implementations.
//!
//! A transport moves raw JSON-RPC messages over one medium: a child process's
//! stdio pipes, a WebSocket, streamable HTTP POSTs, or a persistent SSE
//! stream. Inbound traffic and connection-level problems are reported as
//! [`TransportEvent`]s on the channel handed to [`Transport::start`]; the
//! transport never interprets JSON-RPC semantics beyond framing.
//!
//! When a request cannot be delivered, the transport answers it itself with a
//! synthesized `-32000` error response so the owner's pending request always
//! resolves.

mod http;
mod sse;
mod stdio;
mod websocket;

pub use http::HttpTransport;
pub use sse::{SseTransport, RECONNECT_DELAYS};
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use toolbridge_core::{ServerConfig, TransportConfig, TransportKind};
use tracing::warn;

use crate::error::{TransportError, TRANSPORT_FAILURE_CODE};
use crate::protocol::JsonRpcMessage;

/// Something a transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound JSON-RPC message.
    Message(JsonRpcMessage),
    /// The medium is gone for good, with the process exit code if any.
    Closed(Option<i32>),
    /// A connection-level problem; see [`TransportError::is_recoverable`].
    Error(TransportError),
}

/// Channel a transport reports its events on.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half handed to the transport's owner.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the event channel for one transport.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which medium this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Open the medium and begin reporting events.
    async fn start(&self, events: EventSender) -> Result<(), TransportError>;

    /// Send one message.
    ///
    /// Fails with [`TransportError::NotConnected`] before `start`. Delivery
    /// failures of requests are answered through the event channel instead
    /// of being returned.
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Tear the medium down. Always returns within a bounded time.
    async fn stop(&self);

    /// OS process id, for transports backed by a child process.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Build the transport for a server configuration.
pub fn create(config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let transport: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Arc::new(StdioTransport::new(
            &config.id,
            command,
            args.clone(),
            env.clone(),
            cwd.clone(),
        )),
        TransportConfig::WebSocket { url, headers } => {
            Arc::new(WebSocketTransport::new(&config.id, url, headers.clone()))
        }
        TransportConfig::Http { url, headers } => {
            Arc::new(HttpTransport::new(&config.id, parse_url(url)?, header_map(headers)?)?)
        }
        TransportConfig::Sse { url, headers } => {
            Arc::new(SseTransport::new(&config.id, parse_url(url)?, header_map(headers)?)?)
        }
    };
    Ok(transport)
}

fn parse_url(url: &str) -> Result<reqwest::Url, TransportError> {
    reqwest::Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))
}

/// Convert configured headers into a reqwest header map.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidUrl(format!("header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidUrl(format!("header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Answer an undeliverable message.
///
/// Requests get a synthesized `-32000` response on the event channel and the
/// send counts as handled; anything else hands the error back to the caller.
pub(crate) fn undeliverable(
    server_id: &str,
    events: Option<&EventSender>,
    message: &JsonRpcMessage,
    error: TransportError,
) -> Result<(), TransportError> {
    let (Some(id), Some(events)) = (message.request_id(), events) else {
        return Err(error);
    };

    warn!(
        server = %server_id,
        id = %id,
        method = message.method().unwrap_or_default(),
        error = %error,
        "Request could not be delivered"
    );

    let response = JsonRpcMessage::error(id.clone(), TRANSPORT_FAILURE_CODE, error.to_string());
    if events.send(TransportEvent::Message(response)).is_err() {
        return Err(error);
    }
    Ok(())
}

/// Deliver every message decoded from a JSON payload.
pub(crate) fn deliver_json(server_id: &str, events: &EventSender, text: &str) {
    match crate::protocol::decode_str(text) {
        Ok(messages) => {
            for message in messages {
                let _ = events.send(TransportEvent::Message(message));
            }
        }
        Err(e) => {
            warn!(server = %server_id, error = %e, "Skipping unparseable message");
        }
    }
}
