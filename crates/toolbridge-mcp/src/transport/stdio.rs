//! Child-process transport speaking newline-delimited JSON over stdio.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use toolbridge_core::TransportKind;
use tracing::{debug, info, warn};

use super::{deliver_json, undeliverable, EventSender, Transport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;

/// How long a terminated process may take to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for buffered stdout after the process exited.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

/// Standard I/O transport for MCP servers.
///
/// Spawns the configured command, writes one JSON message per line to its
/// stdin and reads one message per line from its stdout. Stderr is logged.
pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events: Mutex<Option<EventSender>>,
    pid: Mutex<Option<u32>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new(
        server_id: &str,
        command: &str,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            command: command.to_string(),
            args,
            env,
            cwd,
            stdin: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            pid: Mutex::new(None),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// The command line, wrapped in `cmd /C` on Windows so `.cmd` shims resolve.
    ///
    /// On Unix a command without separate args that needs shell parsing
    /// (`FOO=1 node server.js`, `~/bin/server`) runs through `sh -c`.
    fn command(&self) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command).args(&self.args);
            cmd
        };

        #[cfg(not(windows))]
        let mut cmd = if self.args.is_empty() && needs_shell(&self.command) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        } else {
            let mut cmd = Command::new(&self.command);
            cmd.args(&self.args);
            cmd
        };

        cmd.envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd
    }
}

/// Whether a command line only makes sense to a shell.
#[cfg(not(windows))]
fn needs_shell(command: &str) -> bool {
    command.starts_with('~')
        || command
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '$' | '|' | '&' | ';' | '<' | '>' | '*' | '"' | '\''))
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut stdin_slot = self.stdin.lock().await;
        if stdin_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        debug!(
            server = %self.server_id,
            command = %self.command,
            args = ?self.args,
            "Spawning MCP server process"
        );

        let mut child = self.command().spawn().map_err(TransportError::SpawnFailed)?;

        let missing = |pipe: &str| {
            TransportError::SpawnFailed(std::io::Error::other(format!("failed to capture {}", pipe)))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        let reader = tokio::spawn(read_stdout(self.server_id.clone(), stdout, events.clone()));
        tokio::spawn(log_stderr(self.server_id.clone(), stderr));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            self.server_id.clone(),
            child,
            reader,
            shutdown_rx,
            events.clone(),
        ));

        *stdin_slot = Some(stdin);
        *self.events.lock() = Some(events);
        *self.pid.lock() = pid;
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.supervisor.lock() = Some(supervisor);

        info!(server = %self.server_id, pid = ?pid, "MCP server process spawned");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let line = serde_json::to_string(&message).map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;

        debug!(server = %self.server_id, message = %line, "Sending message to MCP server");

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        drop(guard);

        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                let events = self.events.lock().clone();
                undeliverable(&self.server_id, events.as_ref(), &message, TransportError::WriteError(e))
            }
        }
    }

    async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }

        // Closing stdin lets well-behaved servers exit on their own.
        self.stdin.lock().await.take();

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!(server = %self.server_id, error = %e, "Process supervisor failed");
            }
        }
        *self.pid.lock() = None;
    }

    fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }
}

/// Split stdout into lines and deliver each as a message.
async fn read_stdout(server_id: String, stdout: impl AsyncRead + Unpin, events: EventSender) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(server = %server_id, message = %line, "Received message from MCP server");
                deliver_json(&server_id, &events, line);
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(TransportError::ReadError(e)));
                break;
            }
        }
    }

    debug!(server = %server_id, "MCP server stdout closed");
}

async fn log_stderr(server_id: String, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                debug!(target: "toolbridge_mcp::stderr", server = %server_id, "{}", line);
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!(target: "toolbridge_mcp::stderr", server = %server_id, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}

/// Own the child: report its exit, or terminate it on request.
async fn supervise(
    server_id: String,
    mut child: Child,
    reader: JoinHandle<()>,
    shutdown: oneshot::Receiver<()>,
    events: EventSender,
) {
    let (code, exited) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            info!(server = %server_id, code = ?code, "MCP server process exited");
            (code, true)
        }
        _ = shutdown => (terminate(&server_id, &mut child).await, false),
    };

    // Output written right before exit must be delivered before Closed.
    if exited && tokio::time::timeout(STDOUT_DRAIN, reader).await.is_err() {
        debug!(server = %server_id, "Stdout still open after exit");
    }

    let _ = events.send(TransportEvent::Closed(code));
}

/// SIGTERM, then kill once the grace period runs out.
async fn terminate(server_id: &str, child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            debug!(server = %server_id, pid = pid, "Sending SIGTERM to MCP server");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(server = %server_id, error = %e, "SIGTERM failed");
            }

            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(status) => {
                    debug!(server = %server_id, "MCP server exited gracefully");
                    return status.ok().and_then(|s| s.code());
                }
                Err(_) => {
                    warn!(server = %server_id, "MCP server did not exit gracefully, killing");
                }
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!(server = %server_id, error = %e, "Failed to kill MCP server process");
    }
    child.try_wait().ok().flatten().and_then(|s| s.code())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::event_channel;

    #[tokio::test]
    async fn test_cat_echoes_messages() {
        let transport = StdioTransport::new("cat", "cat", Vec::new(), BTreeMap::new(), None);
        let (tx, mut rx) = event_channel();
        transport.start(tx).await.unwrap();
        assert!(transport.pid().is_some());

        let ping = JsonRpcMessage::request(1u64, "ping", None);
        transport.send(ping.clone()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Message(message) => assert_eq!(message, ping),
            other => panic!("unexpected event {:?}", other),
        }

        transport.stop().await;
        assert!(transport.pid().is_none());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(_))));
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let transport = StdioTransport::new("cat", "cat", Vec::new(), BTreeMap::new(), None);
        let result = transport.send(JsonRpcMessage::notification("x", None)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_needs_shell() {
        assert!(needs_shell("FOO=1 node server.js"));
        assert!(needs_shell("~/bin/server"));
        assert!(needs_shell("server | tee log"));
        assert!(!needs_shell("npx"));
        assert!(!needs_shell("/usr/local/bin/mcp-server"));
    }

    #[tokio::test]
    async fn test_command_line_runs_through_shell() {
        let transport = StdioTransport::new(
            "shell",
            r#"GREETING=ready; echo "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/$GREETING\"}"; exit 3"#,
            Vec::new(),
            BTreeMap::new(),
            None,
        );
        let (tx, mut rx) = event_channel();
        transport.start(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Message(message) => assert_eq!(message.method(), Some("notifications/ready")),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(Some(3)))));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let transport = StdioTransport::new(
            "missing",
            "/definitely/not/a/real/binary",
            Vec::new(),
            BTreeMap::new(),
            None,
        );
        let (tx, _rx) = event_channel();
        assert!(matches!(transport.start(tx).await, Err(TransportError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_non_json_lines_are_skipped() {
        let transport = StdioTransport::new(
            "sh",
            "sh",
            vec![
                "-c".to_string(),
                r#"echo 'starting up'; echo '{"jsonrpc":"2.0","method":"notifications/ready"}'"#.to_string(),
            ],
            BTreeMap::new(),
            None,
        );
        let (tx, mut rx) = event_channel();
        transport.start(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Message(message) => assert_eq!(message.method(), Some("notifications/ready")),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(Some(0)))));
    }
}
