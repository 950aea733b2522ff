use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tron_core::ClientError;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// The transition table. Anything may move to `Closed`; nothing leaves it.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Reconnecting | Disconnected) => true,
            (Reconnecting, Connected | Reconnecting | Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition, delivered to state observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Single owner of the connection state: lock-free reads, serialized
/// validated transitions, and a watch channel for observers.
pub(crate) struct StateCell {
    current: AtomicU8,
    transitions: Mutex<()>,
    watch: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (watch, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            current: AtomicU8::new(ConnectionState::Disconnected as u8),
            transitions: Mutex::new(()),
            watch,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch.subscribe()
    }

    /// Move to `to` if the current state is one of `expected` and the
    /// table allows it.
    pub(crate) fn transition(
        &self,
        expected: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<StateChange, ClientError> {
        let _guard = self.transitions.lock();
        let from = self.get();
        if from == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        if !expected.contains(&from) || !from.can_transition_to(to) {
            return Err(ClientError::InvalidState(format!(
                "cannot move from {from} to {to}"
            )));
        }
        self.current.store(to as u8, Ordering::Release);
        self.watch.send_replace(to);
        Ok(StateChange { from, to })
    }

    /// Any → Closed. Returns `None` if already closed.
    pub(crate) fn close(&self) -> Option<StateChange> {
        let _guard = self.transitions.lock();
        let from = self.get();
        if from == ConnectionState::Closed {
            return None;
        }
        self.current
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.watch.send_replace(ConnectionState::Closed);
        Some(StateChange {
            from,
            to: ConnectionState::Closed,
        })
    }
}
