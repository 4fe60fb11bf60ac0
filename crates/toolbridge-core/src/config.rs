//! Configuration system for Toolbridge.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Main configuration struct for Toolbridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client identity and notice settings
    pub client: ClientConfig,
    /// Tool-call retry policy
    pub retry: RetryConfig,
    /// Configured MCP servers
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client name sent in `clientInfo`
    pub name: String,
    /// Client version sent in `clientInfo`
    pub version: String,
    /// Minimum interval between user notices for one server (ms)
    pub notice_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "toolbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            notice_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first failed tool call
    pub max_retries: u32,
    /// Delay before each retry (ms); the last entry is reused if short
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delays_ms: vec![600, 1500],
        }
    }
}

/// Which medium a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local child process over stdio pipes.
    Stdio,
    /// Full-duplex WebSocket.
    WebSocket,
    /// Request/response streamable HTTP.
    Http,
    /// Persistent Server-Sent-Events stream plus POST endpoint.
    Sse,
}

impl TransportKind {
    /// Whether the transport talks to a remote endpoint.
    pub fn is_remote(self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Medium-specific settings, one variant per transport kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a local process and speak newline-delimited JSON over stdio.
    Stdio {
        /// Command to execute.
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Connect to a WebSocket endpoint.
    #[serde(rename = "websocket")]
    WebSocket {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// POST each message to a streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Hold a GET event stream open and POST to its announced endpoint.
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    /// Create a stdio transport config.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// The kind of this transport.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::WebSocket { .. } => TransportKind::WebSocket,
            Self::Http { .. } => TransportKind::Http,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }

    /// Short human-readable target: the command line or the URL.
    pub fn target(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            Self::WebSocket { url, .. } | Self::Http { url, .. } | Self::Sse { url, .. } => {
                url.clone()
            }
        }
    }
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identity; defaults to `name` when omitted in a config file.
    #[serde(default)]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether this server may be connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How the server is reached.
    pub transport: TransportConfig,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServerConfig {
    /// Create a new server configuration; the id is the name.
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            enabled: true,
            transport,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Shorthand for a stdio server.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, TransportConfig::stdio(command, Vec::new()))
    }

    /// Override the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the stdio arguments. No effect on remote transports.
    pub fn with_args(mut self, new_args: Vec<String>) -> Self {
        if let TransportConfig::Stdio { args, .. } = &mut self.transport {
            *args = new_args;
        }
        self
    }

    /// Add a stdio environment variable. No effect on remote transports.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set whether the server is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The transport kind of this server.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "servers[0].timeout_ms")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        let config_dir = Self::config_dir();

        Self::figment(&config_dir.join("config.toml"))
            .extract::<Config>()
            .map(Config::normalized)
    }

    fn figment(user_config: &Path) -> Figment {
        Figment::new()
            // Default values
            .merge(Serialized::defaults(Config::default()))
            // User config
            .merge(Toml::file(user_config))
            // Project config
            .merge(Toml::file(Self::project_config_path()))
            // Project local config (gitignored)
            .merge(Toml::file(".toolbridge/config.local.toml"))
            // Environment variables
            .merge(Env::prefixed("TOOLBRIDGE_").split("_"))
    }

    /// Load a single TOML file on top of the defaults.
    pub fn load_file(path: &Path) -> Result<Self, Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract::<Config>()
            .map(Config::normalized)
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.check()
    }

    fn check(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Validation(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Fill in ids that were omitted in config files.
    fn normalized(mut self) -> Self {
        for server in &mut self.servers {
            if server.id.is_empty() {
                server.id = server.name.clone();
            }
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.client.name.is_empty() {
            result.add_error("client.name", "Client name cannot be empty");
        }

        if self.retry.max_retries > 0 && self.retry.delays_ms.is_empty() {
            result.add_error("retry.delays_ms", "At least one delay is required when retries are enabled");
        }

        if self.retry.max_retries > 5 {
            result.add_warning("retry.max_retries", "More than 5 retries can stall tool calls for a long time");
        }

        let mut seen_ids = std::collections::HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let field = |name: &str| format!("servers[{}].{}", index, name);

            if server.name.is_empty() {
                result.add_error(field("name"), "Server name cannot be empty");
            }

            if !server.id.is_empty() && !seen_ids.insert(server.id.as_str()) {
                result.add_error(field("id"), format!("Duplicate server id '{}'", server.id));
            }

            if server.timeout_ms == 0 {
                result.add_error(field("timeout_ms"), "timeout_ms must be greater than 0");
            } else if server.timeout_ms > 600_000 {
                result.add_warning(field("timeout_ms"), "timeout_ms is over 10 minutes");
            }

            match &server.transport {
                TransportConfig::Stdio { command, args, .. } => {
                    if command.trim().is_empty() {
                        result.add_error(field("transport.command"), "Command cannot be empty");
                    } else if args.is_empty() && command.contains(char::is_whitespace) {
                        result.add_warning(
                            field("transport.command"),
                            "Command contains whitespace; put flags and arguments in 'args'",
                        );
                    }
                }
                TransportConfig::WebSocket { url, .. } => {
                    if !url.starts_with("ws://") && !url.starts_with("wss://") {
                        result.add_error(field("transport.url"), "WebSocket url must start with ws:// or wss://");
                    }
                }
                TransportConfig::Http { url, .. } | TransportConfig::Sse { url, .. } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        result.add_error(field("transport.url"), "url must start with http:// or https://");
                    }
                }
            }
        }

        result
    }

    /// Find a server by id, falling back to its name.
    pub fn server(&self, id_or_name: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.id == id_or_name)
            .or_else(|| self.servers.iter().find(|s| s.name == id_or_name))
    }

    /// Enabled servers in configuration order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Replace the `servers` table of a TOML file, keeping every other key.
    pub fn write_servers(path: &Path, servers: &[ServerConfig]) -> Result<(), Error> {
        let mut document: toml::Table = if path.exists() {
            let existing = std::fs::read_to_string(path)?;
            toml::from_str(&existing).map_err(|e| Error::Config(e.to_string()))?
        } else {
            toml::Table::new()
        };

        let value = toml::Value::try_from(servers).map_err(|e| Error::Config(e.to_string()))?;
        document.insert("servers".to_string(), value);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let rendered = toml::to_string_pretty(&document).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("toolbridge"))
            .unwrap_or_else(|| PathBuf::from("~/.config/toolbridge"))
    }

    /// Project-level config file, relative to the working directory.
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".toolbridge/config.toml")
    }
}
