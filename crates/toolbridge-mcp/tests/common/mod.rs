//! Shared test helpers: a scripted in-memory transport and a recording observer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use toolbridge_core::{ServerConfig, TransportConfig, TransportKind};
use toolbridge_mcp::protocol::{JsonRpcMessage, JsonRpcRequest};
use toolbridge_mcp::transport::EventSender;
use toolbridge_mcp::{
    ConnectionObserver, ConnectionStatus, StatusUpdate, ToolInfo, Transport, TransportError,
    TransportEvent, TransportFactory,
};

/// How the scripted server answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    Err(i64, String),
    After(Duration, Box<Reply>),
    Never,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Ok(json!({"content": [{"type": "text", "text": text}]}))
    }
}

/// Answers `tools/call`; gets the params and the 0-based call count so far.
pub type CallHandler = Arc<dyn Fn(&Value, usize) -> Reply + Send + Sync>;

/// A fake server shared by every transport it creates.
pub struct Script {
    kind: TransportKind,
    on_call: CallHandler,
    counts: Mutex<HashMap<String, usize>>,
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
    stop_delay: Mutex<Duration>,
}

impl Script {
    pub fn new(kind: TransportKind, on_call: impl Fn(&Value, usize) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            kind,
            on_call: Arc::new(on_call),
            counts: Mutex::new(HashMap::new()),
            transports: Mutex::new(Vec::new()),
            stop_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Echo the `text` argument after `delay_ms`, if given.
    pub fn echo(kind: TransportKind) -> Arc<Self> {
        Self::new(kind, |params, _| {
            let args = &params["arguments"];
            let reply = Reply::text(args["text"].as_str().unwrap_or_default());
            match args["delay_ms"].as_u64() {
                Some(ms) => Reply::After(Duration::from_millis(ms), Box::new(reply)),
                None => reply,
            }
        })
    }

    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let script = self.clone();
        Arc::new(move |_config: &ServerConfig| -> Result<Arc<dyn Transport>, TransportError> {
            let transport = Arc::new(ScriptedTransport {
                script: script.clone(),
                events: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                stopped: Mutex::new(false),
            });
            script.transports.lock().push(transport.clone());
            Ok(transport as Arc<dyn Transport>)
        })
    }

    /// How many requests of `method` were received over all transports.
    pub fn count(&self, method: &str) -> usize {
        self.counts.lock().get(method).copied().unwrap_or(0)
    }

    pub fn transports_created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn all(&self) -> Vec<Arc<ScriptedTransport>> {
        self.transports.lock().clone()
    }

    /// Make every `stop` take this long, like a process ignoring SIGTERM.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn last(&self) -> Arc<ScriptedTransport> {
        self.transports.lock().last().cloned().expect("no transport created")
    }

    fn reply(&self, request: &JsonRpcRequest) -> Reply {
        let index = {
            let mut counts = self.counts.lock();
            let count = counts.entry(request.method.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let params = request.params.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "initialize" => Reply::Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "scripted", "version": "1.0"}
            })),
            "tools/list" => Reply::Ok(json!({"tools": [
                {"name": "echo", "inputSchema": {"type": "object"}},
                {"name": "add"}
            ]})),
            "tools/call" => (self.on_call)(&params, index),
            other => Reply::Err(-32601, format!("Method not found: {}", other)),
        }
    }
}

pub struct ScriptedTransport {
    script: Arc<Script>,
    events: Mutex<Option<EventSender>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    stopped: Mutex<bool>,
}

impl ScriptedTransport {
    /// Inject an event as if the medium produced it.
    pub fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().clone().expect("transport not started");
        events.send(event).expect("connection gone");
    }

    pub fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

fn deliver(events: EventSender, id: toolbridge_mcp::protocol::RequestId, reply: Reply) {
    tokio::spawn(async move {
        let mut reply = reply;
        loop {
            match reply {
                Reply::After(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                }
                Reply::Ok(result) => {
                    let _ = events.send(TransportEvent::Message(JsonRpcMessage::result(id, result)));
                    return;
                }
                Reply::Err(code, message) => {
                    let _ = events.send(TransportEvent::Message(JsonRpcMessage::error(id, code, message)));
                    return;
                }
                Reply::Never => return,
            }
        }
    });
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.script.kind
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let events = self.events.lock().clone().ok_or(TransportError::NotConnected)?;
        self.sent.lock().push(message.clone());

        if let JsonRpcMessage::Request(request) = &message {
            let reply = self.script.reply(request);
            deliver(events, request.id.clone(), reply);
        }
        Ok(())
    }

    async fn stop(&self) {
        let delay = *self.script.stop_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.stopped.lock() = true;
        if let Some(events) = self.events.lock().take() {
            let _ = events.send(TransportEvent::Closed(None));
        }
    }
}

/// A server config whose transport kind matches the script.
pub fn server(kind: TransportKind) -> ServerConfig {
    let transport = match kind {
        TransportKind::Stdio => TransportConfig::stdio("scripted", Vec::new()),
        TransportKind::WebSocket => TransportConfig::WebSocket {
            url: "ws://scripted".to_string(),
            headers: Default::default(),
        },
        TransportKind::Http => TransportConfig::Http {
            url: "http://scripted/mcp".to_string(),
            headers: Default::default(),
        },
        TransportKind::Sse => TransportConfig::Sse {
            url: "http://scripted/sse".to_string(),
            headers: Default::default(),
        },
    };
    ServerConfig::new("scripted", transport).with_timeout_ms(2_000)
}

/// Observer that records everything it hears.
#[derive(Default)]
pub struct Recorder {
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub catalogs: Mutex<Vec<Vec<ToolInfo>>>,
    pub notices: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

impl ConnectionObserver for Recorder {
    fn status_changed(&self, update: &StatusUpdate) {
        let mut statuses = self.statuses.lock();
        // The pid refresh repeats Connecting; keep the transition list readable.
        if statuses.last() != Some(&update.status) {
            statuses.push(update.status);
        }
    }

    fn tools_changed(&self, _server_id: &str, tools: &[ToolInfo]) {
        self.catalogs.lock().push(tools.to_vec());
    }

    fn notice(&self, _server_id: &str, message: &str) {
        self.notices.lock().push(message.to_string());
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
