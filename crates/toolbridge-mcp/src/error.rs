//! MCP-specific error types and failure classification.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// Transport was started twice.
    #[error("transport already started")]
    AlreadyStarted,

    /// Connecting took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// WebSocket protocol or I/O failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// URL could not be parsed or resolved.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Inbound payload was not valid JSON-RPC.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The event stream dropped and a reconnect is scheduled.
    #[error("event stream lost ({reason}); reconnect attempt {attempt} in {delay:?}")]
    Reconnecting {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}

impl TransportError {
    /// Whether the transport will recover from this on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server not found by id.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Server is disabled in configuration.
    #[error("server is disabled: {0}")]
    Disabled(String),

    /// Server initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i64, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request timed out.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Connection was torn down while the request was pending.
    #[error("disconnected")]
    Disconnected,

    /// No transport is active.
    #[error("not connected")]
    NotConnected,
}

/// How a failure should be treated by the tool-call retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The tool or server rejected the call on its merits; report it as output.
    Business,
    /// Infrastructure hiccup worth retrying.
    Transient,
    /// Infrastructure failure that a retry will not fix.
    Fatal,
}

/// Code used for errors synthesized by transports when a request cannot be delivered.
pub const TRANSPORT_FAILURE_CODE: i64 = -32000;

static TRANSIENT_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)timed? ?out|econnreset|econnrefused|econnaborted|connection (reset|refused|closed|aborted)|socket hang up|service unavailable|bad gateway|gateway time|temporarily unavailable|too many requests|broken pipe|network|disconnected|\b50[0234]\b",
    )
    .expect("valid regex")
});

static SESSION_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)session|expired|\b40[14]\b").expect("valid regex")
});

fn is_business_code(code: i64) -> bool {
    (-499..=-400).contains(&code)
        || (400..=499).contains(&code)
        || code == JsonRpcError::INVALID_PARAMS
}

fn is_server_fault_code(code: i64) -> bool {
    (500..=599).contains(&code) || (-599..=-500).contains(&code) || code == TRANSPORT_FAILURE_CODE
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a server error from JSON-RPC error.
    pub fn server_error(code: i64, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Classify the failure for the retry policy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::ServerError { code, message } => {
                if is_business_code(*code) {
                    ErrorClass::Business
                } else if is_server_fault_code(*code) || TRANSIENT_HINT.is_match(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Transport(TransportError::Status { status, .. }) if (400..500).contains(status) => {
                // 404 and 401 usually mean a lost session, which a reconnect can fix.
                if matches!(status, 401 | 404 | 408 | 429) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Transport(_) | Self::Timeout { .. } | Self::Disconnected => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether the tool-call policy should retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Whether the failure suggests the remote session expired.
    pub fn is_session_related(&self) -> bool {
        match self {
            Self::Transport(TransportError::Status { status, .. }) => matches!(status, 401 | 404),
            other => SESSION_HINT.is_match(&other.to_string()),
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(e: JsonRpcError) -> Self {
        Self::ServerError {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<McpError> for toolbridge_core::Error {
    fn from(e: McpError) -> Self {
        toolbridge_core::Error::Mcp(e.to_string())
    }
}
