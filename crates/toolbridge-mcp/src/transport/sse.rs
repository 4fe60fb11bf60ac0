//! Persistent SSE transport.
//!
//! A long-lived GET carries server-to-client traffic as SSE events. The
//! `endpoint` event names the URL that client messages are POSTed to. If the
//! stream drops without `stop`, it is reopened with a bounded backoff and each
//! attempt is reported as a recoverable error instead of a close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolbridge_core::TransportKind;
use tracing::{debug, info, warn};

use super::{deliver_json, undeliverable, EventSender, Transport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::{self, JsonRpcMessage};
use crate::sse::{SseEvent, SseParser};

/// Delay before each reconnect attempt; the stream is given up after the last.
pub const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(10),
];

/// How long `start` waits for the first `endpoint` event.
const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

struct Shared {
    server_id: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    endpoint: watch::Sender<Option<Url>>,
}

pub struct SseTransport {
    shared: Arc<Shared>,
    events: Mutex<Option<EventSender>>,
    cancel: Mutex<CancellationToken>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(server_id: &str, url: Url, headers: HeaderMap) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        let (endpoint, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(Shared {
                server_id: server_id.to_string(),
                url,
                headers,
                client,
                endpoint,
            }),
            events: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            stream_task: Mutex::new(None),
        })
    }

    /// Where the next message will be POSTed.
    pub fn endpoint(&self) -> Url {
        self.shared.current_endpoint()
    }
}

impl Shared {
    fn current_endpoint(&self) -> Url {
        self.endpoint.borrow().clone().unwrap_or_else(|| self.url.clone())
    }

    async fn open(&self) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Decode one GET body until it ends; returns why it ended.
    async fn consume(&self, response: reqwest::Response, events: &EventSender) -> String {
        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.feed(&bytes) {
                        self.handle(event, events);
                    }
                }
                Err(e) => return format!("stream error: {}", e),
            }
        }
        if let Some(event) = parser.finish() {
            self.handle(event, events);
        }
        "stream ended".to_string()
    }

    fn handle(&self, event: SseEvent, events: &EventSender) {
        if event.kind() == "endpoint" {
            match self.resolve_endpoint(&event.data) {
                Ok(endpoint) => {
                    debug!(server = %self.server_id, endpoint = %endpoint, "SSE endpoint announced");
                    self.endpoint.send_replace(Some(endpoint));
                }
                Err(e) => warn!(server = %self.server_id, error = %e, "Ignoring endpoint event"),
            }
            return;
        }

        if event.data.trim().is_empty() {
            return;
        }
        debug!(server = %self.server_id, message = %event.data, "Received SSE event");
        deliver_json(&self.server_id, events, &event.data);
    }

    /// The endpoint payload is a URL, absolute or relative to the GET URL,
    /// either as plain text or as `{"uri": ...}`.
    fn resolve_endpoint(&self, data: &str) -> Result<Url, TransportError> {
        let data = data.trim();
        let target = match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(object)) => object
                .get("uri")
                .or_else(|| object.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TransportError::InvalidUrl(data.to_string()))?,
            Ok(Value::String(target)) => target,
            _ => data.to_string(),
        };

        self.url
            .join(&target)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", target, e)))
    }

    async fn post(&self, message: &JsonRpcMessage, events: &EventSender) -> Result<(), TransportError> {
        let endpoint = self.current_endpoint();
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if !is_json {
            // Answers arrive on the event stream.
            return Ok(());
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let messages = protocol::decode_str(&body).map_err(|e| TransportError::Malformed(e.to_string()))?;
        for message in messages {
            let _ = events.send(TransportEvent::Message(message));
        }
        Ok(())
    }
}

/// Keep the event stream alive until cancelled or out of reconnect attempts.
async fn run_stream(
    shared: Arc<Shared>,
    mut response: reqwest::Response,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut attempt = 0usize;

    loop {
        let mut reason = tokio::select! {
            _ = cancel.cancelled() => return,
            reason = shared.consume(response, &events) => reason,
        };

        response = loop {
            let Some(&delay) = RECONNECT_DELAYS.get(attempt) else {
                warn!(server = %shared.server_id, reason = %reason, "SSE stream lost, giving up");
                let _ = events.send(TransportEvent::Closed(None));
                return;
            };
            attempt += 1;

            warn!(
                server = %shared.server_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "SSE stream lost, reconnecting"
            );
            let _ = events.send(TransportEvent::Error(TransportError::Reconnecting {
                attempt: attempt as u32,
                delay,
                reason: reason.clone(),
            }));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = shared.open() => opened,
            };
            match opened {
                Ok(response) => {
                    info!(server = %shared.server_id, attempt = attempt, "SSE stream reconnected");
                    attempt = 0;
                    break response;
                }
                Err(e) => reason = e.to_string(),
            }
        };
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        if self.events.lock().is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        debug!(server = %self.shared.server_id, url = %self.shared.url, "Opening SSE stream");
        let response = self.shared.open().await?;

        let cancel = CancellationToken::new();
        let mut endpoint = self.shared.endpoint.subscribe();
        let task = tokio::spawn(run_stream(
            self.shared.clone(),
            response,
            events.clone(),
            cancel.clone(),
        ));

        *self.events.lock() = Some(events);
        *self.cancel.lock() = cancel;
        *self.stream_task.lock() = Some(task);

        let announced = tokio::time::timeout(ENDPOINT_WAIT, endpoint.wait_for(Option::is_some))
            .await
            .map(|found| found.is_ok())
            .unwrap_or(false);
        if !announced {
            warn!(
                server = %self.shared.server_id,
                "No endpoint event received, posting to the stream URL"
            );
        }

        info!(server = %self.shared.server_id, endpoint = %self.endpoint(), "SSE transport connected");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let events = self.events.lock().clone().ok_or(TransportError::NotConnected)?;
        let cancel = self.cancel.lock().clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.shared.post(&message, &events) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => undeliverable(&self.shared.server_id, Some(&events), &message, e),
        }
    }

    async fn stop(&self) {
        self.cancel.lock().cancel();
        let events = self.events.lock().take();

        let task = self.stream_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(server = %self.shared.server_id, "SSE stream task did not stop in time");
            }
        }

        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed(None));
        }
    }
}
