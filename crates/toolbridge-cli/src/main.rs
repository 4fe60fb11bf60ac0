//! # toolbridge-cli
//!
//! Command-line interface for Toolbridge.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolbridge_core::error::format_error_with_suggestion;
use toolbridge_core::Config;

mod commands;

/// Toolbridge - connect to MCP servers and call their tools
#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use this config file instead of the layered configuration
    #[arg(short, long, value_name = "PATH", env = "TOOLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// MCP server commands
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
    /// Check configuration and server health
    Doctor,
}

#[derive(Subcommand)]
pub enum McpAction {
    /// List configured MCP servers
    List,
    /// Connect to a server and list its tools
    Tools {
        /// Server id or name
        server: String,
    },
    /// Call a tool and print its output
    Call {
        /// Server id or name
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Health-check one server, or every enabled server
    Check {
        /// Server id or name
        server: Option<String>,
    },
    /// Import servers from a Claude-Desktop style config
    Import {
        /// JSON file with an "mcpServers" object
        file: PathBuf,
        /// Append the imported servers to the project config
        #[arg(short, long)]
        write: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show where configuration is read from
    Path,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Ok(Config::load_file(path)?);
    }

    Ok(Config::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    }))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Mcp { action } => {
            commands::mcp::handle(action, &config, cli.json).await?;
        }
        Commands::Config { action } => {
            commands::config::handle(action, &config, cli.json)?;
        }
        Commands::Version => {
            println!("toolbridge {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Doctor => {
            commands::doctor::run(&config).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<toolbridge_core::Error>() {
            Some(error) => eprintln!("Error: {}", format_error_with_suggestion(error)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}
