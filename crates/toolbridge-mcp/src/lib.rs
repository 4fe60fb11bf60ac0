//! # toolbridge-mcp
//!
//! Model Context Protocol client for Toolbridge.
//!
//! This crate provides:
//! - Transports for stdio, WebSocket, streamable HTTP and persistent SSE servers
//! - `McpConnection`: handshake, request correlation and tool calls with retries
//! - `McpServerManager`: lazily connected servers with observable runtime state
//! - Health checks and qualified tool names for hosts

pub mod client;
pub mod error;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod retry;
pub mod sse;
pub mod status;
pub mod tools;
pub mod transport;

pub use client::{ClientOptions, McpConnection, TransportFactory, TOOL_ERROR_PREFIX};
pub use error::{ErrorClass, McpError, TransportError};
pub use health::HealthReport;
pub use manager::{McpServerManager, ServerNotice, ServerRuntimeState};
pub use protocol::ToolInfo;
pub use retry::RetryPolicy;
pub use status::{ConnectionObserver, ConnectionStatus, NoopObserver, StatusUpdate};
pub use tools::{parse_qualified_name, qualified_name, QualifiedTool};
pub use transport::{Transport, TransportEvent};
