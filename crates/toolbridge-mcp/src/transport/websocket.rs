//! WebSocket transport: one JSON-RPC message per text frame.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use toolbridge_core::TransportKind;
use tracing::{debug, info, warn};

use super::{deliver_json, undeliverable, EventSender, Transport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;

/// Upper bound for the opening handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits for the peer to acknowledge the close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    server_id: String,
    url: String,
    headers: BTreeMap<String, String>,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    events: Mutex<Option<EventSender>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Mutex<Option<oneshot::Receiver<()>>>,
}

impl WebSocketTransport {
    pub fn new(server_id: &str, url: &str, headers: BTreeMap<String, String>) -> Self {
        Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            headers,
            sink: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            reader: Mutex::new(None),
            closed: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.url, e)))?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidUrl(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidUrl(format!("header '{}': {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        Ok(stream)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut sink_slot = self.sink.lock().await;
        if sink_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        debug!(server = %self.server_id, url = %self.url, "Opening WebSocket");
        let stream = self.connect().await?;
        let (sink, source) = stream.split();

        let (closed_tx, closed_rx) = oneshot::channel();
        let reader = tokio::spawn(read_frames(self.server_id.clone(), source, events.clone(), closed_tx));

        *sink_slot = Some(sink);
        *self.events.lock() = Some(events);
        *self.reader.lock() = Some(reader);
        *self.closed.lock() = Some(closed_rx);

        info!(server = %self.server_id, url = %self.url, "WebSocket connected");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(&message).map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;

        debug!(server = %self.server_id, message = %text, "Sending WebSocket frame");
        let sent = sink.send(Message::Text(text.into())).await;
        drop(guard);

        match sent {
            Ok(()) => Ok(()),
            Err(e) => {
                let events = self.events.lock().clone();
                undeliverable(
                    &self.server_id,
                    events.as_ref(),
                    &message,
                    TransportError::WebSocket(e.to_string()),
                )
            }
        }
    }

    async fn stop(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(server = %self.server_id, error = %e, "WebSocket close frame not sent");
            }
        }

        let closed = self.closed.lock().take();
        if let Some(closed) = closed {
            if tokio::time::timeout(CLOSE_TIMEOUT, closed).await.is_err() {
                warn!(server = %self.server_id, "WebSocket close was not acknowledged, dropping");
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_frames(
    server_id: String,
    mut source: SplitStream<WsStream>,
    events: EventSender,
    closed: oneshot::Sender<()>,
) {
    let mut code = None;

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!(server = %server_id, message = %text.as_str(), "Received WebSocket frame");
                deliver_json(&server_id, &events, text.as_str());
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => deliver_json(&server_id, &events, text),
                Err(_) => warn!(server = %server_id, "Ignoring non UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                code = frame.map(|f| i32::from(u16::from(f.code)));
                break;
            }
            // Pings are answered by tungstenite itself.
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(TransportEvent::Error(TransportError::WebSocket(e.to_string())));
                break;
            }
        }
    }

    info!(server = %server_id, code = ?code, "WebSocket closed");
    let _ = closed.send(());
    let _ = events.send(TransportEvent::Closed(code));
}
