//! MCP client implementation.
//!
//! [`McpConnection`] owns one logical server connection: it creates the
//! transport, performs the handshake, correlates requests with responses by
//! id and applies the retry policy to tool calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use toolbridge_core::{Config, ServerConfig};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, McpError, TransportError};
use crate::protocol::{
    methods, CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, ServerInfo, ToolInfo,
};
use crate::retry::RetryPolicy;
use crate::status::{ConnectionObserver, ConnectionStatus, NoopObserver, NoticeGate, StatusUpdate};
use crate::transport::{self, EventReceiver, Transport, TransportEvent};

/// Prefix marking tool output that reports a failure.
pub const TOOL_ERROR_PREFIX: &str = "[tool error] ";

/// Upper bound on `tools/list` pages followed in one refresh.
const MAX_TOOL_PAGES: usize = 64;

/// Upper bound on a transport's `stop`, on top of its own grace periods.
const STOP_TIMEOUT: Duration = Duration::from_secs(8);

/// Builds the transport for a server; replaceable in tests.
pub type TransportFactory =
    Arc<dyn Fn(&ServerConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Settings shared by every connection of one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identity sent in `initialize`.
    pub client_info: ClientInfo,
    /// Tool-call retry schedule.
    pub retry: RetryPolicy,
    /// Minimum interval between user notices per connection.
    pub notice_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            client_info: ClientInfo {
                name: config.client.name.clone(),
                version: config.client.version.clone(),
            },
            retry: RetryPolicy::from(&config.retry),
            notice_interval: Duration::from_millis(config.client.notice_interval_ms),
        }
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>;

/// Removes a pending entry however the request ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct Inner {
    config: ServerConfig,
    options: ClientOptions,
    observer: Arc<dyn ConnectionObserver>,
    factory: TransportFactory,
    status: RwLock<ConnectionStatus>,
    last_error: RwLock<Option<String>>,
    tools: RwLock<Vec<ToolInfo>>,
    server_info: RwLock<Option<ServerInfo>>,
    pending: PendingMap,
    next_id: AtomicU64,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    notices: NoticeGate,
}

/// A connection to a single MCP server.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct McpConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("server", &self.inner.config.id)
            .field("status", &self.status())
            .finish()
    }
}

impl McpConnection {
    /// Create an idle connection for a server.
    pub fn new(config: ServerConfig, options: ClientOptions, observer: Arc<dyn ConnectionObserver>) -> Self {
        Self::with_factory(config, options, observer, Arc::new(transport::create))
    }

    /// Create an idle connection that builds its transport with `factory`.
    pub fn with_factory(
        config: ServerConfig,
        options: ClientOptions,
        observer: Arc<dyn ConnectionObserver>,
        factory: TransportFactory,
    ) -> Self {
        let notices = NoticeGate::new(options.notice_interval);
        Self {
            inner: Arc::new(Inner {
                config,
                options,
                observer,
                factory,
                status: RwLock::new(ConnectionStatus::Idle),
                last_error: RwLock::new(None),
                tools: RwLock::new(Vec::new()),
                server_info: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                transport: RwLock::new(None),
                pump: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                notices,
            }),
        }
    }

    /// A connection with default options and no observer.
    pub fn standalone(config: ServerConfig) -> Self {
        Self::new(config, ClientOptions::default(), Arc::new(NoopObserver))
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// The last known tool catalog.
    pub fn tools(&self) -> Vec<ToolInfo> {
        self.inner.tools.read().clone()
    }

    /// Server identity from the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.read().clone()
    }

    /// Process id of a stdio server.
    pub fn pid(&self) -> Option<u32> {
        self.inner.transport.read().as_ref().and_then(|t| t.pid())
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        let previous = std::mem::replace(&mut *self.inner.status.write(), status);
        match &error {
            Some(message) => *self.inner.last_error.write() = Some(message.clone()),
            None if status == ConnectionStatus::Running => *self.inner.last_error.write() = None,
            None => {}
        }

        debug!(server = %self.id(), from = %previous, to = %status, "Connection status changed");

        self.inner.observer.status_changed(&StatusUpdate {
            server_id: self.id().to_string(),
            status,
            error,
            pid: self.pid(),
        });
    }

    /// Log always; tell the user at most once per notice interval.
    fn notice(&self, message: String) {
        warn!(server = %self.id(), "{}", message);
        if self.inner.notices.allow() {
            self.inner.observer.notice(self.id(), &message);
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().clone()
    }

    /// Connect and perform the handshake. No-op when already running.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status().is_running() {
            return Ok(());
        }
        if !self.inner.config.enabled {
            return Err(McpError::Disabled(self.id().to_string()));
        }

        // Leftovers from an earlier failed attempt.
        self.teardown_transport().await;

        info!(
            server = %self.id(),
            transport = %self.inner.config.kind(),
            target = %self.inner.config.transport.target(),
            "Connecting to MCP server"
        );
        self.set_status(ConnectionStatus::Connecting, None);

        match self.establish().await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Running, None);
                info!(
                    server = %self.id(),
                    tools = self.inner.tools.read().len(),
                    "MCP connection initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                self.teardown_transport().await;
                self.notice(format!("Failed to connect to MCP server '{}': {}", self.name(), e));
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), McpError> {
        let transport = (self.inner.factory)(&self.inner.config)?;
        let (events_tx, events_rx) = transport::event_channel();

        *self.inner.transport.write() = Some(transport.clone());
        let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), events_rx));
        *self.inner.pump.lock() = Some(pump);

        transport.start(events_tx).await?;
        if transport.pid().is_some() {
            // Publish the pid as soon as it is known.
            self.set_status(ConnectionStatus::Connecting, None);
        }

        let params = serde_json::to_value(InitializeParams::new(self.inner.options.client_info.clone()))?;
        let result = self.request(methods::INITIALIZE, Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::init_failed(format!("invalid initialize result: {}", e)))?;

        debug!(
            server = %self.id(),
            server_name = %init.server_info.name,
            protocol_version = %init.protocol_version,
            "Handshake complete"
        );
        *self.inner.server_info.write() = Some(init.server_info);

        if let Err(e) = self.notify(methods::INITIALIZED, None).await {
            warn!(server = %self.id(), error = %e, "Failed to send initialized notification");
        }

        self.refresh_tools().await?;
        Ok(())
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let transport = self.transport().ok_or(McpError::NotConnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        debug!(server = %self.id(), id = id, method = method, "Sending request");

        let message = JsonRpcMessage::request(id, method, params);
        // The response may arrive before `send` returns.
        let exchange = async {
            let send = transport.send(message);
            tokio::pin!(send);
            let sent = tokio::select! {
                biased;
                reply = &mut rx => return reply.unwrap_or(Err(McpError::Disconnected)),
                sent = &mut send => sent,
            };
            sent.map_err(McpError::from)?;
            rx.await.unwrap_or(Err(McpError::Disconnected))
        };

        let timeout_ms = self.inner.config.timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(server = %self.id(), id = id, method = method, timeout_ms = timeout_ms, "Request timed out");
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let transport = self.transport().ok_or(McpError::NotConnected)?;
        transport
            .send(JsonRpcMessage::notification(method, params))
            .await
            .map_err(McpError::from)
    }

    /// Fetch the tool catalog and replace the cached one.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request(methods::TOOLS_LIST, Some(params)).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| McpError::protocol(format!("invalid tools/list result: {}", e)))?;

            tools.extend(
                page.tools
                    .into_iter()
                    .map(|definition| ToolInfo::from_definition(definition, self.id())),
            );

            cursor = page.next_cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        if cursor.is_some() {
            warn!(server = %self.id(), pages = MAX_TOOL_PAGES, "Tool list truncated");
        }

        debug!(server = %self.id(), tool_count = tools.len(), "Listed tools");

        *self.inner.tools.write() = tools.clone();
        self.inner.observer.tools_changed(self.id(), &tools);
        Ok(tools)
    }

    /// Call a tool and return the concatenation of its text parts.
    ///
    /// Tool-reported failures come back as `Ok` text prefixed with
    /// [`TOOL_ERROR_PREFIX`]. Infrastructure failures are retried per the
    /// connection's [`RetryPolicy`] and returned as `Err` once exhausted.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        let mut retry = 0;
        loop {
            let error = match self.request(methods::TOOLS_CALL, Some(params.clone())).await {
                Ok(result) => return self.tool_output(name, result),
                Err(e) => e,
            };

            match error.classify() {
                ErrorClass::Business => {
                    debug!(server = %self.id(), tool = name, error = %error, "Tool rejected the call");
                    let message = match &error {
                        McpError::ServerError { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    return Ok(format!("{}{}", TOOL_ERROR_PREFIX, message));
                }
                ErrorClass::Fatal => {
                    self.notice(format!("Tool '{}' on '{}' failed: {}", name, self.name(), error));
                    return Err(error);
                }
                ErrorClass::Transient => {}
            }

            retry += 1;
            let Some(delay) = self.inner.options.retry.delay_for(retry) else {
                self.notice(format!(
                    "Tool '{}' on '{}' failed after {} attempts: {}",
                    name,
                    self.name(),
                    retry,
                    error
                ));
                return Err(error);
            };

            if retry == 1 && self.inner.config.kind().is_remote() && error.is_session_related() {
                info!(server = %self.id(), error = %error, "Session looks expired, reconnecting");
                self.disconnect().await;
                if let Err(e) = self.connect().await {
                    warn!(server = %self.id(), error = %e, "Reconnect before retry failed");
                }
            }

            warn!(
                server = %self.id(),
                tool = name,
                retry = retry,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying tool call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn tool_output(&self, name: &str, result: Value) -> Result<String, McpError> {
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid tools/call result: {}", e)))?;

        let text = result.text();
        if result.is_error {
            debug!(server = %self.id(), tool = name, "Tool returned error");
            return Ok(format!("{}{}", TOOL_ERROR_PREFIX, text));
        }
        Ok(text)
    }

    /// Tear the connection down. Every step runs even if an earlier one fails.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.status() != ConnectionStatus::Stopped {
            self.set_status(ConnectionStatus::Stopping, None);
        }
        self.teardown_transport().await;

        let had_tools = !std::mem::take(&mut *self.inner.tools.write()).is_empty();
        if had_tools {
            self.inner.observer.tools_changed(self.id(), &[]);
        }

        self.set_status(ConnectionStatus::Stopped, None);
        info!(server = %self.id(), "MCP connection closed");
    }

    /// Fail everything pending, stop the transport and the event pump.
    async fn teardown_transport(&self) {
        let failed = self.fail_pending(|| McpError::Disconnected);
        if failed > 0 {
            debug!(server = %self.id(), count = failed, "Rejected pending requests");
        }

        let transport = self.inner.transport.write().take();
        if let Some(transport) = transport {
            if tokio::time::timeout(STOP_TIMEOUT, transport.stop()).await.is_err() {
                error!(server = %self.id(), "Transport did not stop in time");
            }
        }

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }

    fn fail_pending(&self, error: impl Fn() -> McpError) -> usize {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                if self.status() == ConnectionStatus::Error && self.transport().is_some() {
                    info!(server = %self.id(), "MCP connection recovered");
                    self.set_status(ConnectionStatus::Running, None);
                }
                match message {
                    JsonRpcMessage::Response(response) => self.resolve(response),
                    JsonRpcMessage::Notification(notification) => self.on_notification(notification),
                    JsonRpcMessage::Request(request) => self.on_server_request(request),
                }
            }
            TransportEvent::Error(e) => {
                warn!(server = %self.id(), error = %e, "Transport error");
                if self.status().is_running() {
                    self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                } else {
                    *self.inner.last_error.write() = Some(e.to_string());
                }
            }
            TransportEvent::Closed(code) => {
                let status = self.status();
                if status.is_shutting_down() {
                    return;
                }
                warn!(server = %self.id(), code = ?code, "Transport closed unexpectedly");
                self.fail_pending(|| McpError::Disconnected);
                if status != ConnectionStatus::Error {
                    let message = match code {
                        Some(code) => format!("connection closed (exit code {})", code),
                        None => "connection closed".to_string(),
                    };
                    self.set_status(ConnectionStatus::Error, Some(message));
                }
            }
        }
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let id = response.id.as_ref().and_then(|id| id.as_u64());
        let waiter = id.and_then(|id| self.inner.pending.lock().remove(&id));

        match waiter {
            Some(tx) => {
                let _ = tx.send(response.into_result().map_err(McpError::from));
            }
            None => {
                warn!(server = %self.id(), id = ?response.id, "Dropping response with unknown id");
            }
        }
    }

    fn on_notification(&self, notification: JsonRpcNotification) {
        if notification.method == methods::TOOLS_LIST_CHANGED {
            debug!(server = %self.id(), "Tool list changed, refreshing");
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.refresh_tools().await {
                    warn!(server = %connection.id(), error = %e, "Tool refresh failed");
                }
            });
            return;
        }
        debug!(server = %self.id(), method = %notification.method, "Ignoring notification");
    }

    fn on_server_request(&self, request: JsonRpcRequest) {
        let reply = if request.method == methods::PING {
            JsonRpcMessage::result(request.id, json!({}))
        } else {
            debug!(server = %self.id(), method = %request.method, "Rejecting server request");
            JsonRpcMessage::error(
                request.id,
                JsonRpcError::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            )
        };

        let Some(transport) = self.transport() else {
            return;
        };
        let server_id = self.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.send(reply).await {
                warn!(server = %server_id, error = %e, "Failed to answer server request");
            }
        });
    }
}

/// Feed transport events to the connection until either side goes away.
async fn pump(inner: Weak<Inner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        McpConnection { inner }.handle_event(event);
    }
}
