//! Connection status and the observer interface connections report through.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::protocol::ToolInfo;

/// Lifecycle of one server connection.
///
/// `Idle → Connecting → Running → Stopping → Stopped`, with `Error` reachable
/// from any non-terminal state. A connection in `Error` returns to `Running`
/// when its transport delivers a message again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ConnectionStatus {
    /// Whether requests can be sent.
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Whether the connection is being or has been torn down on purpose.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A status change of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub server_id: String,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub pid: Option<u32>,
}

/// Receives everything a connection wants its owner to know.
///
/// Callbacks run synchronously on the connection's task and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn status_changed(&self, _update: &StatusUpdate) {}

    fn tools_changed(&self, _server_id: &str, _tools: &[ToolInfo]) {}

    /// A message meant for the user, already rate limited.
    fn notice(&self, _server_id: &str, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// Lets at most one notice through per interval.
#[derive(Debug)]
pub(crate) struct NoticeGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl NoticeGate {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub(crate) fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Running.to_string(), "running");
        assert_eq!(serde_json::to_string(&ConnectionStatus::Error).unwrap(), "\"error\"");
        assert!(ConnectionStatus::Stopping.is_shutting_down());
        assert!(!ConnectionStatus::Error.is_shutting_down());
    }

    #[test]
    fn test_notice_gate() {
        let gate = NoticeGate::new(Duration::from_secs(10));
        assert!(gate.allow());
        assert!(!gate.allow());

        let open = NoticeGate::new(Duration::ZERO);
        assert!(open.allow());
        assert!(open.allow());
    }
}
