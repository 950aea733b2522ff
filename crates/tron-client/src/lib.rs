//! Client-side engine for the tron daemon protocol.
//!
//! A [`DaemonClient`] owns one connection to the daemon: it dials, runs the
//! newline-delimited JSON pump, correlates requests with responses, routes
//! unsolicited frames to registered callbacks and handlers, and reconnects
//! with exponential backoff when the link drops.

mod api;
pub mod client;
pub mod config;
mod correlator;
pub mod dispatch;
mod keepalive;
pub mod mock;
mod pump;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod stats;
pub mod transcript;
pub mod transport;

pub use client::DaemonClient;
pub use config::{Address, ClientConfig, ReconnectConfig};
pub use dispatch::{AuthorizationHandler, Callbacks, QuestionHandler, ReconnectNotice};
pub use reconnect::Backoff;
pub use session::SessionHandle;
pub use state::{ConnectionState, StateChange};
pub use stats::{ClientStats, StatsSnapshot};
pub use transcript::Transcript;
pub use transport::{Dialer, SocketDialer};

pub use tron_core::{ClientError, Frame, FrameKind, TimeoutKind};
