//! Registry of MCP connections keyed by server id.
//!
//! The manager connects servers lazily on first use, reuses running
//! connections and replaces broken ones. Every status and catalog change is
//! folded into one list of [`ServerRuntimeState`] that owners can watch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use toolbridge_core::{Config, ServerConfig};
use tracing::{debug, info};

use crate::client::{ClientOptions, McpConnection, TransportFactory};
use crate::error::McpError;
use crate::protocol::ToolInfo;
use crate::status::{ConnectionObserver, ConnectionStatus, StatusUpdate};
use crate::transport;

const NOTICE_CAPACITY: usize = 64;

/// What the manager knows about one server right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerRuntimeState {
    pub server_id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub tools: Vec<ToolInfo>,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRuntimeState {
    fn new(config: &ServerConfig) -> Self {
        Self {
            server_id: config.id.clone(),
            name: config.name.clone(),
            status: ConnectionStatus::Idle,
            tools: Vec::new(),
            last_error: None,
            pid: None,
            updated_at: Utc::now(),
        }
    }
}

/// A user-facing message from one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotice {
    pub server_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Aggregated state, updated by the connections' observer callbacks.
struct StateBoard {
    states: RwLock<BTreeMap<String, ServerRuntimeState>>,
    published: watch::Sender<Vec<ServerRuntimeState>>,
    notices: broadcast::Sender<ServerNotice>,
    /// The connection currently allowed to update each server's state.
    owners: RwLock<HashMap<String, u64>>,
    next_owner: AtomicU64,
}

impl StateBoard {
    fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            states: RwLock::new(BTreeMap::new()),
            published,
            notices,
            owners: RwLock::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
        }
    }

    /// Hand a server's state to a new connection; older ones go quiet.
    fn claim(self: &Arc<Self>, server_id: &str) -> Arc<dyn ConnectionObserver> {
        let owner = self.next_owner.fetch_add(1, Ordering::SeqCst);
        self.owners.write().insert(server_id.to_string(), owner);
        Arc::new(BoardView {
            board: self.clone(),
            owner,
        })
    }

    fn owned_by(&self, server_id: &str, owner: u64) -> bool {
        self.owners.read().get(server_id) == Some(&owner)
    }

    fn register(&self, config: &ServerConfig) {
        self.states
            .write()
            .insert(config.id.clone(), ServerRuntimeState::new(config));
        self.publish();
    }

    fn update(&self, server_id: &str, apply: impl FnOnce(&mut ServerRuntimeState)) {
        {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(server_id) else {
                debug!(server = %server_id, "Update for unregistered server ignored");
                return;
            };
            apply(state);
            state.updated_at = Utc::now();
        }
        self.publish();
    }

    fn snapshot(&self) -> Vec<ServerRuntimeState> {
        self.states.read().values().cloned().collect()
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot());
    }

    fn clear(&self) {
        self.owners.write().clear();
        self.states.write().clear();
        self.publish();
    }
}

impl ConnectionObserver for StateBoard {
    fn status_changed(&self, update: &StatusUpdate) {
        self.update(&update.server_id, |state| {
            state.status = update.status;
            state.pid = update.pid;
            match &update.error {
                Some(error) => state.last_error = Some(error.clone()),
                None if update.status == ConnectionStatus::Running => state.last_error = None,
                None => {}
            }
        });
    }

    fn tools_changed(&self, server_id: &str, tools: &[ToolInfo]) {
        self.update(server_id, |state| state.tools = tools.to_vec());
    }

    fn notice(&self, server_id: &str, message: &str) {
        // No subscribers is fine.
        let _ = self.notices.send(ServerNotice {
            server_id: server_id.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

/// One connection's window onto the board.
struct BoardView {
    board: Arc<StateBoard>,
    owner: u64,
}

impl ConnectionObserver for BoardView {
    fn status_changed(&self, update: &StatusUpdate) {
        if self.board.owned_by(&update.server_id, self.owner) {
            self.board.status_changed(update);
        } else {
            debug!(server = %update.server_id, status = %update.status, "Ignoring status of a replaced connection");
        }
    }

    fn tools_changed(&self, server_id: &str, tools: &[ToolInfo]) {
        if self.board.owned_by(server_id, self.owner) {
            self.board.tools_changed(server_id, tools);
        }
    }

    fn notice(&self, server_id: &str, message: &str) {
        self.board.notice(server_id, message);
    }
}

/// Owns every MCP connection of the application.
pub struct McpServerManager {
    options: ClientOptions,
    factory: TransportFactory,
    board: Arc<StateBoard>,
    servers: RwLock<Vec<ServerConfig>>,
    clients: Mutex<HashMap<String, McpConnection>>,
    disposed: AtomicBool,
}

impl McpServerManager {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_factory(options, Arc::new(transport::create))
    }

    /// A manager whose connections build transports with `factory`.
    pub fn with_factory(options: ClientOptions, factory: TransportFactory) -> Self {
        Self {
            options,
            factory,
            board: Arc::new(StateBoard::new()),
            servers: RwLock::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// A manager that knows every server in the configuration.
    pub fn from_config(config: &Config) -> Self {
        let manager = Self::new(ClientOptions::from(config));
        for server in &config.servers {
            manager.register(server.clone());
        }
        manager
    }

    /// Make a server known without connecting it.
    pub fn register(&self, config: ServerConfig) {
        self.board.register(&config);
        let mut servers = self.servers.write();
        match servers.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => servers.push(config),
        }
    }

    /// Configuration of a known server, by id or name.
    pub fn server_config(&self, id_or_name: &str) -> Option<ServerConfig> {
        let servers = self.servers.read();
        servers
            .iter()
            .find(|s| s.id == id_or_name)
            .or_else(|| servers.iter().find(|s| s.name == id_or_name))
            .cloned()
    }

    /// Return a running connection for `config`, connecting it if needed.
    ///
    /// An idle, connecting or running connection with the same configuration
    /// is reused; anything else is torn down and replaced. The old connection
    /// is torn down outside the registry lock.
    pub async fn ensure_connected(&self, config: &ServerConfig) -> Result<McpConnection, McpError> {
        if !config.enabled {
            return Err(McpError::Disabled(config.id.clone()));
        }

        let (connection, stale) = {
            let mut clients = self.clients.lock().await;
            // `dispose` drains under this lock; nothing may be added after it.
            if self.is_disposed() {
                return Err(McpError::NotConnected);
            }

            match clients.get(&config.id) {
                Some(existing)
                    if existing.config() == config
                        && matches!(
                            existing.status(),
                            ConnectionStatus::Idle | ConnectionStatus::Running | ConnectionStatus::Connecting
                        ) =>
                {
                    (existing.clone(), None)
                }
                _ => {
                    let stale = clients.remove(&config.id);

                    self.register(config.clone());
                    let fresh = McpConnection::with_factory(
                        config.clone(),
                        self.options.clone(),
                        self.board.claim(&config.id),
                        self.factory.clone(),
                    );
                    clients.insert(config.id.clone(), fresh.clone());
                    (fresh, stale)
                }
            }
        };

        if let Some(stale) = stale {
            debug!(server = %config.id, status = %stale.status(), "Replacing connection");
            stale.disconnect().await;
        }

        connection.connect().await?;

        if self.is_disposed() {
            connection.disconnect().await;
            return Err(McpError::NotConnected);
        }
        Ok(connection)
    }

    /// Connect a registered server by id or name.
    pub async fn connect(&self, id_or_name: &str) -> Result<McpConnection, McpError> {
        let config = self
            .server_config(id_or_name)
            .ok_or_else(|| McpError::ServerNotFound(id_or_name.to_string()))?;
        self.ensure_connected(&config).await
    }

    /// Call a tool on a registered server, connecting it first if needed.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<String, McpError> {
        let connection = self.connect(server).await?;
        connection.call_tool(tool, arguments).await
    }

    /// Tear down one connection.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), McpError> {
        let connection = self
            .clients
            .lock()
            .await
            .remove(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        connection.disconnect().await;
        Ok(())
    }

    /// Tear down every connection concurrently. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<McpConnection> = self.clients.lock().await.drain().map(|(_, c)| c).collect();
        info!(count = connections.len(), "Disposing MCP connections");

        join_all(connections.iter().map(|connection| connection.disconnect())).await;

        self.board.clear();
        self.servers.write().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The live connection for a server id, if one exists.
    pub async fn get(&self, server_id: &str) -> Option<McpConnection> {
        self.clients.lock().await.get(server_id).cloned()
    }

    /// Current state of every known server, ordered by id.
    pub fn states(&self) -> Vec<ServerRuntimeState> {
        self.board.snapshot()
    }

    /// State of one server.
    pub fn state(&self, server_id: &str) -> Option<ServerRuntimeState> {
        self.board.states.read().get(server_id).cloned()
    }

    /// Every tool of every server, in server order.
    pub fn all_tools(&self) -> Vec<ToolInfo> {
        self.board
            .states
            .read()
            .values()
            .flat_map(|state| state.tools.iter().cloned())
            .collect()
    }

    /// Watch the aggregated state list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ServerRuntimeState>> {
        self.board.published.subscribe()
    }

    /// Receive rate-limited user notices.
    pub fn notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.board.notices.subscribe()
    }
}
