//! Streamable HTTP transport.
//!
//! Every message is an independent POST. The server answers with `202
//! Accepted`, a JSON body (one message or a batch) or an SSE-framed body. A
//! session id handed out in `Mcp-Session-Id` is echoed on later requests
//! until the server forgets it (404).

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use toolbridge_core::TransportKind;
use tracing::{debug, info, warn};

use super::{undeliverable, EventSender, Transport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::{self, JsonRpcMessage, RequestId};
use crate::sse::SseParser;

/// Header carrying the streamable HTTP session id.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Upper bound for the best-effort session DELETE on stop.
const DELETE_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest error body kept in a status error.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpTransport {
    server_id: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session: RwLock<Option<String>>,
    events: Mutex<Option<EventSender>>,
    cancel: Mutex<CancellationToken>,
}

impl HttpTransport {
    pub fn new(server_id: &str, url: Url, headers: HeaderMap) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            server_id: server_id.to_string(),
            url,
            headers,
            client,
            session: RwLock::new(None),
            events: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// The session id currently echoed on requests.
    pub fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    async fn post(&self, message: &JsonRpcMessage, events: &EventSender) -> Result<(), TransportError> {
        let sent_session = self.session_id();

        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(message);
        if let Some(session) = &sent_session {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;
        let status = response.status();

        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            if sent_session.as_deref() != Some(session) {
                debug!(server = %self.server_id, session = %session, "MCP session established");
                *self.session.write() = Some(session.to_string());
            }
        }

        if status == StatusCode::NOT_FOUND && sent_session.is_some() {
            warn!(server = %self.server_id, "MCP session expired, starting a new one on the next request");
            *self.session.write() = None;
        }

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let expected = message.request_id();
        if status == StatusCode::ACCEPTED {
            return match expected {
                Some(_) => Err(TransportError::Malformed("request accepted without a response".to_string())),
                None => Ok(()),
            };
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let mut answered = false;
        if is_stream {
            let mut parser = SseParser::new();
            let mut body = Box::pin(response.bytes_stream());

            // Read until the request is answered; the server may keep the
            // stream open afterwards for further messages.
            while expected.is_some() && !answered {
                let Some(chunk) = body.next().await else {
                    if let Some(event) = parser.finish() {
                        answered |= deliver(&self.server_id, events, &event.data, expected)?;
                    }
                    return finish_exchange(expected, answered);
                };
                for event in parser.feed(&chunk?) {
                    answered |= deliver(&self.server_id, events, &event.data, expected)?;
                }
            }

            let cancel = self.cancel.lock().clone();
            tokio::spawn(forward_stream(
                self.server_id.clone(),
                events.clone(),
                parser,
                body,
                cancel,
            ));
        } else {
            let body = response.text().await?;
            answered = deliver(&self.server_id, events, &body, expected)?;
        }

        finish_exchange(expected, answered)
    }
}

fn finish_exchange(expected: Option<&RequestId>, answered: bool) -> Result<(), TransportError> {
    if expected.is_some() && !answered {
        return Err(TransportError::Malformed("response did not answer the request".to_string()));
    }
    Ok(())
}

/// Deliver one JSON payload; returns whether it answered `expected`.
fn deliver(
    server_id: &str,
    events: &EventSender,
    payload: &str,
    expected: Option<&RequestId>,
) -> Result<bool, TransportError> {
    if payload.trim().is_empty() {
        return Ok(false);
    }

    debug!(server = %server_id, message = %payload, "Received HTTP payload");
    let messages = protocol::decode_str(payload).map_err(|e| TransportError::Malformed(e.to_string()))?;

    let mut answered = false;
    for message in messages {
        if let (JsonRpcMessage::Response(response), Some(id)) = (&message, expected) {
            answered |= response.id.as_ref() == Some(id);
        }
        let _ = events.send(TransportEvent::Message(message));
    }
    Ok(answered)
}

/// Keep delivering messages from an SSE response body until it ends or the
/// transport stops.
async fn forward_stream<S, B>(
    server_id: String,
    events: EventSender,
    mut parser: SseParser,
    mut body: S,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                for event in parser.feed(chunk.as_ref()) {
                    if let Err(e) = deliver(&server_id, &events, &event.data, None) {
                        warn!(server = %server_id, error = %e, "Skipping malformed stream event");
                    }
                }
            }
            Some(Err(e)) => {
                debug!(server = %server_id, error = %e, "Response stream failed");
                return;
            }
            None => break,
        }
    }

    if let Some(event) = parser.finish() {
        if let Err(e) = deliver(&server_id, &events, &event.data, None) {
            warn!(server = %server_id, error = %e, "Skipping malformed stream event");
        }
    }
    debug!(server = %server_id, "Response stream ended");
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut slot = self.events.lock();
        if slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        *slot = Some(events);
        *self.cancel.lock() = CancellationToken::new();

        info!(server = %self.server_id, url = %self.url, "HTTP transport ready");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let events = self.events.lock().clone().ok_or(TransportError::NotConnected)?;
        let cancel = self.cancel.lock().clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.post(&message, &events) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => undeliverable(&self.server_id, Some(&events), &message, e),
        }
    }

    async fn stop(&self) {
        self.cancel.lock().cancel();
        let events = self.events.lock().take();

        let session = self.session.write().take();
        if let Some(session) = session {
            let request = self
                .client
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session);

            match tokio::time::timeout(DELETE_TIMEOUT, request.send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    debug!(server = %self.server_id, "MCP session deleted");
                }
                Ok(Ok(response)) => {
                    debug!(server = %self.server_id, status = %response.status(), "Session delete not supported");
                }
                Ok(Err(e)) => debug!(server = %self.server_id, error = %e, "Session delete failed"),
                Err(_) => debug!(server = %self.server_id, "Session delete timed out"),
            }
        }

        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed(None));
        }
    }
}
