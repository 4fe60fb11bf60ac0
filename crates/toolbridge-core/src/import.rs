//! Import of Claude-Desktop compatible `mcpServers` documents.
//!
//! The accepted shape is
//! `{"mcpServers": {"<name>": {"command"|"url", "args"?, "env"?, "headers"?, "type"?}}}`.
//! Entries that cannot be mapped to a transport are reported as skipped
//! instead of failing the whole import.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::{ServerConfig, TransportConfig, DEFAULT_TIMEOUT_MS};
use crate::error::Error;

#[derive(Debug, Deserialize)]
struct DesktopConfig {
    #[serde(rename = "mcpServers")]
    mcp_servers: Option<BTreeMap<String, DesktopServer>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DesktopServer {
    command: Option<String>,
    url: Option<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    cwd: Option<PathBuf>,
    /// Request timeout in milliseconds.
    timeout: Option<u64>,
    disabled: bool,
}

/// An entry that was not imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Key of the entry in `mcpServers`.
    pub name: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Servers converted successfully, ordered by name.
    pub servers: Vec<ServerConfig>,
    /// Entries that could not be converted.
    pub skipped: Vec<SkippedEntry>,
}

/// Parse a `mcpServers` JSON document into server configurations.
///
/// Every imported server gets a fresh UUID as its id.
pub fn parse_mcp_servers_json(json: &str) -> Result<ImportReport, Error> {
    let document: DesktopConfig =
        serde_json::from_str(json).map_err(|e| Error::Import(format!("invalid JSON: {}", e)))?;

    let entries = document
        .mcp_servers
        .ok_or_else(|| Error::Import("missing \"mcpServers\" object".to_string()))?;

    let mut report = ImportReport::default();
    for (name, entry) in entries {
        match convert(&name, entry) {
            Ok(server) => report.servers.push(server),
            Err(reason) => {
                tracing::warn!(server = %name, reason = %reason, "Skipping imported MCP server");
                report.skipped.push(SkippedEntry { name, reason });
            }
        }
    }

    Ok(report)
}

fn convert(name: &str, entry: DesktopServer) -> Result<ServerConfig, String> {
    let kind = entry.kind.as_deref().map(str::to_ascii_lowercase);

    let transport = match (kind.as_deref(), entry.command, entry.url) {
        (Some("stdio") | None, Some(command), _) => {
            if command.trim().is_empty() {
                return Err("empty command".to_string());
            }
            TransportConfig::Stdio {
                command,
                args: entry.args,
                env: entry.env,
                cwd: entry.cwd,
            }
        }
        (Some("stdio"), None, _) => return Err("stdio server without a command".to_string()),
        (Some("http" | "streamable-http" | "streamablehttp"), _, Some(url)) => {
            TransportConfig::Http {
                url,
                headers: entry.headers,
            }
        }
        (Some("sse" | "remote-sse"), _, Some(url)) => TransportConfig::Sse {
            url,
            headers: entry.headers,
        },
        (Some("websocket" | "ws"), _, Some(url)) => TransportConfig::WebSocket {
            url,
            headers: entry.headers,
        },
        (None, None, Some(url)) => {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                TransportConfig::WebSocket {
                    url,
                    headers: entry.headers,
                }
            } else {
                TransportConfig::Http {
                    url,
                    headers: entry.headers,
                }
            }
        }
        (Some(other), _, None) if other != "stdio" => {
            return Err(format!("transport '{}' requires a url", other))
        }
        (Some(other), _, _) => return Err(format!("unknown transport type '{}'", other)),
        (None, None, None) => return Err("neither command nor url given".to_string()),
    };

    Ok(ServerConfig {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        enabled: !entry.disabled,
        transport,
        timeout_ms: entry.timeout.filter(|t| *t > 0).unwrap_or(DEFAULT_TIMEOUT_MS),
    })
}

/// Append imported servers whose names are not configured yet.
///
/// Returns how many servers were added.
pub fn merge(existing: &mut Vec<ServerConfig>, imported: Vec<ServerConfig>) -> usize {
    let mut added = 0;
    for server in imported {
        if existing.iter().any(|s| s.name == server.name) {
            tracing::debug!(server = %server.name, "Server already configured, not importing");
            continue;
        }
        existing.push(server);
        added += 1;
    }
    added
}
