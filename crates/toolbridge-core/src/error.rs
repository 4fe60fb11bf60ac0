//! Error types for Toolbridge.
//!
//! Structured errors with recovery suggestions, shared by the library crates
//! and the CLI.

use thiserror::Error;

/// Result type alias using the Toolbridge error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Toolbridge.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config import error
    #[error("Import error: {0}")]
    Import(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => {
                Some("Check your config file at ~/.config/toolbridge/config.toml")
            }
            Error::Import(_) => {
                Some("The import file must be a JSON object with an \"mcpServers\" map")
            }
            Error::NotFound(_) => Some("Use 'toolbridge mcp list' to see configured servers"),
            Error::Validation(_) => Some("Run 'toolbridge doctor' for a full report"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
