//! Diagnostic command: configuration and server health.

use toolbridge_core::Config;
use toolbridge_mcp::ClientOptions;

use super::mcp::{check_all, print_reports};

pub async fn run(config: &Config) -> anyhow::Result<()> {
    println!("Running diagnostics...\n");

    // Check config directory
    let config_dir = Config::config_dir();
    println!("Config directory: {:?}", config_dir);
    if config_dir.exists() {
        println!("  ✓ Exists");
    } else {
        println!("  ✗ Does not exist (optional)");
    }

    let project = Config::project_config_path();
    println!("\nProject config: {:?}", project);
    if project.exists() {
        println!("  ✓ Exists");
    } else {
        println!("  ✗ Not found (optional)");
    }

    // Validate configuration
    println!("\nConfiguration:");
    let result = config.validate();
    if result.issues.is_empty() {
        println!("  ✓ Valid");
    }
    for issue in result.errors() {
        println!("  ✗ {}: {}", issue.field, issue.message);
    }
    for issue in result.warnings() {
        println!("  ! {}: {}", issue.field, issue.message);
    }

    // Check servers
    let servers: Vec<_> = config.enabled_servers().cloned().collect();
    let disabled = config.servers.len() - servers.len();
    println!("\nMCP servers ({} enabled, {} disabled):", servers.len(), disabled);
    let reports = check_all(&servers, &ClientOptions::from(config)).await;
    print_reports(&reports, false)?;

    println!("\nDiagnostics complete.");
    if !result.is_ok() {
        anyhow::bail!("configuration has {} errors", result.errors().len());
    }
    Ok(())
}
