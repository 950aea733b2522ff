use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tron_core::ClientError;

/// Diagnostic counters. Relaxed ordering throughout; values are advisory.
#[derive(Debug, Default)]
pub struct ClientStats {
    requests_sent: AtomicU64,
    responses: AtomicU64,
    server_errors: AtomicU64,
    timeouts: AtomicU64,
    frames_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    pongs: AtomicU64,
    last_pong_ms: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_sent: u64,
    pub responses: u64,
    pub server_errors: u64,
    pub timeouts: u64,
    pub frames_dropped: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub pongs: u64,
    pub last_pong: Option<DateTime<Utc>>,
}

impl ClientStats {
    pub(crate) fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify a finished request.
    pub(crate) fn request_finished<T>(&self, outcome: &Result<T, ClientError>) {
        match outcome {
            Ok(_) => {
                self.responses.fetch_add(1, Ordering::Relaxed);
            }
            Err(ClientError::Server { .. }) => {
                self.responses.fetch_add(1, Ordering::Relaxed);
                self.server_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(ClientError::Timeout { .. }) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }

    pub(crate) fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pong(&self) {
        self.pongs.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_pong_ms.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            pongs: self.pongs.load(Ordering::Relaxed),
            last_pong: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last as i64).single())
                .flatten(),
        }
    }
}
