//! One-shot connectivity check for a server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use toolbridge_core::ServerConfig;
use tracing::debug;

use crate::client::{ClientOptions, McpConnection};
use crate::status::NoopObserver;

/// Outcome of [`check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub server_id: String,
    pub name: String,
    pub ok: bool,
    pub tool_count: usize,
    pub tools: Vec<String>,
    /// Time spent connecting and listing tools.
    #[serde(with = "millis")]
    pub latency: Duration,
    pub error: Option<String>,
}

/// Connect, list tools and disconnect. Failures end up in the report.
pub async fn check(config: &ServerConfig, options: &ClientOptions) -> HealthReport {
    let started = Instant::now();
    let connection = McpConnection::new(config.clone(), options.clone(), Arc::new(NoopObserver));

    let outcome = connection.connect().await;
    let latency = started.elapsed();
    let tools: Vec<String> = connection.tools().into_iter().map(|t| t.name).collect();
    connection.disconnect().await;

    debug!(server = %config.id, ok = outcome.is_ok(), latency_ms = latency.as_millis() as u64, "Health check finished");

    HealthReport {
        server_id: config.id.clone(),
        name: config.name.clone(),
        ok: outcome.is_ok(),
        tool_count: tools.len(),
        tools,
        latency,
        error: outcome.err().map(|e| e.to_string()),
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_reports_spawn_failure() {
        let config = ServerConfig::stdio("broken", "/definitely/not/a/real/binary");
        let report = check(&config, &ClientOptions::default()).await;

        assert!(!report.ok);
        assert_eq!(report.tool_count, 0);
        assert!(report.error.unwrap().contains("spawn"));
    }

    #[test]
    fn test_report_serializes_latency_as_millis() {
        let report = HealthReport {
            server_id: "fs".to_string(),
            name: "fs".to_string(),
            ok: true,
            tool_count: 0,
            tools: Vec::new(),
            latency: Duration::from_millis(1500),
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["latency"], 1500);
    }
}
