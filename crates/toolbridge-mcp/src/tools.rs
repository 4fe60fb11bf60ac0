//! Flattened tool catalogs for hosts that expose tools of several servers.
//!
//! Tools are renamed `mcp__<server>__<tool>` so names from different servers
//! cannot collide, and the name alone is enough to route a call back.

use serde::Serialize;
use serde_json::Value;

use crate::error::McpError;
use crate::manager::McpServerManager;
use crate::protocol::ToolInfo;

/// Prefix for MCP tool names to avoid collisions with host tools.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

const SEPARATOR: &str = "__";

/// A tool under its collision-free name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualifiedTool {
    /// Full name, e.g. `mcp__filesystem__read_file`.
    pub name: String,
    pub server_id: String,
    /// Name on the server.
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<&ToolInfo> for QualifiedTool {
    fn from(tool: &ToolInfo) -> Self {
        Self {
            name: qualified_name(&tool.server_id, &tool.name),
            server_id: tool.server_id.clone(),
            tool_name: tool.name.clone(),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| format!("MCP tool from {}", tool.server_id)),
            input_schema: tool.input_schema.clone(),
        }
    }
}

pub fn qualified_name(server_id: &str, tool: &str) -> String {
    format!("{}{}{}{}", MCP_TOOL_PREFIX, server_id, SEPARATOR, tool)
}

/// Split a qualified name into `(server_id, tool)`.
///
/// The first separator after the prefix ends the server id, so tool names
/// may themselves contain `__`.
pub fn parse_qualified_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?;
    let (server, tool) = rest.split_once(SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

impl McpServerManager {
    /// Every known tool under its qualified name.
    pub fn qualified_tools(&self) -> Vec<QualifiedTool> {
        self.all_tools().iter().map(QualifiedTool::from).collect()
    }

    /// Route a call by qualified tool name.
    pub async fn call_qualified(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let (server, tool) = parse_qualified_name(name)
            .ok_or_else(|| McpError::protocol(format!("not an MCP tool name: {}", name)))?;
        self.call_tool(server, tool, arguments).await
    }
}
