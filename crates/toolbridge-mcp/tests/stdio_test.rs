//! End-to-end tests over stdio against the bundled `stub-server` binary.

mod common;

use std::sync::Arc;

use serde_json::json;
use toolbridge_core::ServerConfig;
use toolbridge_mcp::{health, ClientOptions, ConnectionStatus, McpConnection, McpServerManager};

use common::Recorder;

const STUB: &str = env!("CARGO_BIN_EXE_stub-server");

fn stub(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, STUB).with_timeout_ms(5_000)
}

#[tokio::test]
async fn test_stdio_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let connection = McpConnection::new(stub("stub"), ClientOptions::default(), recorder.clone());

    connection.connect().await.unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Running);
    assert!(connection.pid().is_some());
    assert_eq!(connection.server_info().unwrap().name, "stub-server");

    let names: Vec<String> = connection.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "add", "fail"]);

    assert_eq!(connection.call_tool("echo", json!({"text": "hi"})).await.unwrap(), "hi");
    assert_eq!(connection.call_tool("add", json!({"a": 2, "b": 3})).await.unwrap(), "5");
    assert_eq!(
        connection.call_tool("fail", json!({})).await.unwrap(),
        "[tool error] something went wrong"
    );
    assert_eq!(
        connection.call_tool("nope", json!({})).await.unwrap(),
        "[tool error] Unknown tool: nope"
    );

    connection.disconnect().await;

    assert_eq!(connection.status(), ConnectionStatus::Stopped);
    assert!(connection.tools().is_empty());
    assert_eq!(
        recorder.statuses(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Running,
            ConnectionStatus::Stopping,
            ConnectionStatus::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_stdio_follows_tool_pages() {
    let config = stub("paged").with_args(vec!["--page-size".to_string(), "1".to_string()]);
    let connection = McpConnection::standalone(config);

    connection.connect().await.unwrap();

    let names: Vec<String> = connection.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "add", "fail"]);
    connection.disconnect().await;
}

#[tokio::test]
async fn test_stdio_concurrent_calls() {
    let connection = McpConnection::standalone(stub("stub"));
    connection.connect().await.unwrap();

    let calls = (0..8).map(|i| {
        let connection = connection.clone();
        async move { connection.call_tool("echo", json!({"text": format!("msg-{}", i)})).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), format!("msg-{}", i));
    }
    connection.disconnect().await;
}

#[tokio::test]
async fn test_spawn_failure_sets_error() {
    let recorder = Arc::new(Recorder::default());
    let connection = McpConnection::new(
        ServerConfig::stdio("missing", "/definitely/not/a/real/binary"),
        ClientOptions::default(),
        recorder.clone(),
    );

    assert!(connection.connect().await.is_err());
    assert_eq!(connection.status(), ConnectionStatus::Error);
    assert!(connection.last_error().unwrap().contains("spawn"));
    assert_eq!(recorder.notices().len(), 1);
}

#[tokio::test]
async fn test_manager_connects_lazily() {
    let manager = McpServerManager::new(ClientOptions::default());
    manager.register(stub("stub"));

    assert_eq!(manager.state("stub").unwrap().status, ConnectionStatus::Idle);

    let output = manager.call_tool("stub", "echo", json!({"text": "lazy"})).await.unwrap();
    assert_eq!(output, "lazy");

    let state = manager.state("stub").unwrap();
    assert_eq!(state.status, ConnectionStatus::Running);
    assert_eq!(state.tools.len(), 3);
    assert!(state.pid.is_some());

    let qualified: Vec<String> = manager.qualified_tools().into_iter().map(|t| t.name).collect();
    assert!(qualified.contains(&"mcp__stub__echo".to_string()));
    assert_eq!(
        manager.call_qualified("mcp__stub__add", json!({"a": 1, "b": 1})).await.unwrap(),
        "2"
    );

    manager.dispose().await;
    assert!(manager.is_disposed());
    assert!(manager.states().is_empty());
}

#[tokio::test]
async fn test_manager_reuses_running_connection() {
    let manager = McpServerManager::new(ClientOptions::default());
    let config = stub("stub");

    let first = manager.ensure_connected(&config).await.unwrap();
    let second = manager.ensure_connected(&config).await.unwrap();
    assert_eq!(first.pid(), second.pid());

    manager.disconnect("stub").await.unwrap();
    assert_eq!(manager.state("stub").unwrap().status, ConnectionStatus::Stopped);

    let third = manager.ensure_connected(&config).await.unwrap();
    assert_ne!(first.pid(), third.pid());
    manager.dispose().await;
}

#[tokio::test]
async fn test_health_check_lists_tools() {
    let report = health::check(&stub("stub"), &ClientOptions::default()).await;

    assert!(report.ok, "{:?}", report.error);
    assert_eq!(report.tool_count, 3);
    assert_eq!(report.tools, vec!["echo", "add", "fail"]);
}
