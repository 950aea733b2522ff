use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

/// Where the daemon listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// `host:port` for platforms without Unix sockets, or tests.
    Tcp(String),
}

impl FromStr for Address {
    type Err = String;

    /// Accepts `unix:<path>`, `tcp:<host:port>`, `tcp://<host:port>`, or a
    /// bare absolute/relative path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty unix socket path".into());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            let host = rest.trim_start_matches("//");
            if !host.contains(':') {
                return Err(format!("tcp address needs host:port, got {host:?}"));
            }
            return Ok(Self::Tcp(host.to_string()));
        }
        if s.starts_with('/') || s.starts_with('.') || s.starts_with('~') {
            return Ok(Self::Unix(expand_home(s)));
        }
        Err(format!("unrecognised daemon address: {s}"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(host) => write!(f, "tcp:{host}"),
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::Unix(tron_dir().join("daemon.sock"))
    }
}

/// Reconnection supervisor settings.
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Connection parameters. Fixed once the client is constructed.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub address: Address,
    /// Identity declared in the handshake.
    pub client_name: String,
    pub client_version: String,
    pub capabilities: Vec<String>,
    /// Optional bearer token sent in the handshake.
    pub token: Option<SecretString>,
    pub connect_timeout: Duration,
    /// Maximum silence on the inbound side before the link is considered dead.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub request_timeout: Duration,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Capacity of the outgoing frame queue.
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    /// How long `disconnect` waits for the daemon to acknowledge.
    pub disconnect_grace: Duration,
    /// Cap on concurrently running callbacks. `None` = unbounded.
    pub max_concurrent_callbacks: Option<usize>,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: Address::default(),
            client_name: "tron-client".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            capabilities: vec![
                "chat".into(),
                "tools".into(),
                "authorization".into(),
                "questions".into(),
            ],
            token: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            disconnect_grace: Duration::from_secs(2),
            max_concurrent_callbacks: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect.enabled = false;
        self
    }
}

fn tron_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tron")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(rest),
        None => PathBuf::from(path),
    }
}
