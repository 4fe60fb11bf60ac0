//! MCP server commands.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use toolbridge_core::import::{self, ImportReport};
use toolbridge_core::{Config, Error, ServerConfig};
use toolbridge_mcp::health::{self, HealthReport};
use toolbridge_mcp::{ClientOptions, McpServerManager, TOOL_ERROR_PREFIX};

use crate::McpAction;

pub async fn handle(action: McpAction, config: &Config, json: bool) -> anyhow::Result<()> {
    match action {
        McpAction::List => list(config, json),
        McpAction::Tools { server } => tools(config, &server, json).await,
        McpAction::Call { server, tool, args } => call(config, &server, &tool, &args).await,
        McpAction::Check { server } => {
            let servers: Vec<ServerConfig> = match server {
                Some(name) => vec![find(config, &name)?.clone()],
                None => config.enabled_servers().cloned().collect(),
            };
            let reports = check_all(&servers, &ClientOptions::from(config)).await;
            print_reports(&reports, json)?;

            let failed = reports.iter().filter(|r| !r.ok).count();
            if failed > 0 {
                anyhow::bail!("{} of {} servers failed the health check", failed, reports.len());
            }
            Ok(())
        }
        McpAction::Import { file, write } => import_file(&file, write),
    }
}

fn find<'a>(config: &'a Config, name: &str) -> Result<&'a ServerConfig, Error> {
    config
        .server(name)
        .ok_or_else(|| Error::NotFound(format!("MCP server '{}'", name)))
}

fn list(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.servers)?);
        return Ok(());
    }

    if config.servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    println!("Configured MCP servers:");
    for server in &config.servers {
        let state = if server.enabled { "" } else { " (disabled)" };
        println!(
            "  {} [{}] {}{}",
            server.name,
            server.kind(),
            server.transport.target(),
            state
        );
    }
    Ok(())
}

async fn tools(config: &Config, name: &str, json: bool) -> anyhow::Result<()> {
    let server = find(config, name)?.clone();
    let manager = McpServerManager::new(ClientOptions::from(config));

    let result = manager.ensure_connected(&server).await;
    let tools = result.map(|connection| connection.tools());
    manager.dispose().await;
    let tools = tools?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    println!("{} tools on {}:", tools.len(), server.name);
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {} - {}", tool.name, first_line(description)),
            None => println!("  {}", tool.name),
        }
    }
    Ok(())
}

async fn call(config: &Config, name: &str, tool: &str, args: &str) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;
    let server = find(config, name)?.clone();
    let manager = McpServerManager::new(ClientOptions::from(config));

    let result = match manager.ensure_connected(&server).await {
        Ok(connection) => connection.call_tool(tool, arguments).await,
        Err(e) => Err(e),
    };
    manager.dispose().await;
    let output = result?;

    println!("{}", output);
    if output.starts_with(TOOL_ERROR_PREFIX) {
        anyhow::bail!("tool '{}' reported an error", tool);
    }
    Ok(())
}

/// Tool arguments must be a JSON object.
fn parse_arguments(args: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object, got {}", value);
    }
    Ok(value)
}

/// Health-check every server concurrently.
pub async fn check_all(servers: &[ServerConfig], options: &ClientOptions) -> Vec<HealthReport> {
    futures::future::join_all(servers.iter().map(|server| health::check(server, options))).await
}

pub fn print_reports(reports: &[HealthReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("  No enabled MCP servers.");
    }
    for report in reports {
        if report.ok {
            println!(
                "  ✓ {} ({} tools, {} ms)",
                report.name,
                report.tool_count,
                report.latency.as_millis()
            );
        } else {
            println!(
                "  ✗ {}: {}",
                report.name,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

fn read_import(file: &Path) -> anyhow::Result<ImportReport> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(import::parse_mcp_servers_json(&content)?)
}

fn import_file(file: &Path, write: bool) -> anyhow::Result<()> {
    let report = read_import(file)?;

    println!("Found {} MCP servers:", report.servers.len());
    for server in &report.servers {
        println!("  {} [{}] {}", server.name, server.kind(), server.transport.target());
    }
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.name, skipped.reason);
    }

    if !write {
        return Ok(());
    }

    let path = Config::project_config_path();
    let mut servers = if path.exists() {
        Config::load_file(&path)?.servers
    } else {
        Vec::new()
    };
    let added = import::merge(&mut servers, report.servers);
    Config::write_servers(&path, &servers)?;

    println!("Added {} servers to {}", added, path.display());
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_arguments_requires_object() {
        assert!(parse_arguments(r#"{"a": 1}"#).is_ok());
        assert!(parse_arguments("[1, 2]").is_err());
        assert!(parse_arguments("not json").is_err());
    }

    #[test]
    fn test_find_reports_not_found() {
        let config = Config::default();
        let err = find(&config, "missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_read_import_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{
                "fs": {{"command": "npx", "args": ["-y", "server-filesystem"]}},
                "broken": {{"type": "carrier-pigeon"}}
            }}}}"#
        )
        .unwrap();

        let report = read_import(file.path()).unwrap();
        assert_eq!(report.servers.len(), 1);
        assert_eq!(report.servers[0].name, "fs");
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_read_import_missing_file() {
        let err = read_import(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("Read a file\nMore details"), "Read a file");
        assert_eq!(first_line(""), "");
    }
}
