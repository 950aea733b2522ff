use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which bounded wait expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Connect,
    Read,
    Write,
    Request,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Write => "write",
            Self::Request => "request",
        })
    }
}

/// Typed error hierarchy for the daemon client.
/// Classifies errors as connection-level (escalate to reconnection),
/// local (dropped and logged), correlated (one waiter only) or fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    // Connection-level: escalate to reconnection
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{kind} timeout after {after:?}")]
    Timeout { kind: TimeoutKind, after: Duration },

    // Local: a single frame is dropped
    #[error("protocol error: {0}")]
    Protocol(String),

    // Correlated: carried in a response, surfaced only to its waiter
    #[error("server error {code}: {message}")]
    Server {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    // Fatal for the operation
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("invalid state: {0}")]
    InvalidState(String),

    // Frontend callback failure, converted to a safe default by the dispatcher
    #[error("handler failed: {0}")]
    Handler(String),
}

impl ClientError {
    pub fn timeout(kind: TimeoutKind, after: Duration) -> Self {
        Self::Timeout { kind, after }
    }

    /// Errors that a fresh connection attempt may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout {
                    kind: TimeoutKind::Connect | TimeoutKind::Read | TimeoutKind::Write,
                    ..
                }
        )
    }

    /// Errors that must never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Closed)
    }

    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Self::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout { kind, .. } => match kind {
                TimeoutKind::Connect => "connect_timeout",
                TimeoutKind::Read => "read_timeout",
                TimeoutKind::Write => "write_timeout",
                TimeoutKind::Request => "request_timeout",
            },
            Self::Protocol(_) => "protocol",
            Self::Server { .. } => "server",
            Self::Authentication(_) => "authentication",
            Self::Closed => "closed",
            Self::NotConnected => "not_connected",
            Self::InvalidState(_) => "invalid_state",
            Self::Handler(_) => "handler",
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
