//! # toolbridge-core
//!
//! Core types shared by the Toolbridge crates.
//!
//! This crate provides:
//! - Server configuration (`ServerConfig`, `TransportConfig`)
//! - Layered configuration loading and validation
//! - Import of Claude-Desktop style `mcpServers` documents
//! - Common error types

pub mod config;
pub mod error;
pub mod import;

pub use config::{
    ClientConfig, Config, RetryConfig, ServerConfig, TransportConfig, TransportKind,
    DEFAULT_TIMEOUT_MS,
};
pub use error::{Error, Result};
pub use import::{ImportReport, SkippedEntry};
