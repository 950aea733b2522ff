//! Reconnection supervisor: one task per client that consumes link
//! failures in order and drives recovery.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tron_core::payloads::{AttachSession, SetWorkspace};
use tron_core::{ClientError, Frame, FrameKind};

use crate::client::{Inner, LinkFailure};
use crate::dispatch::ReconnectNotice;
use crate::state::ConnectionState;

/// Exponential backoff: `min(base * 2^attempt, max)`, saturating.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the attempt with zero-based index `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max)
    }
}

pub(crate) async fn supervise(
    inner: Weak<Inner>,
    mut failures: mpsc::UnboundedReceiver<LinkFailure>,
    shutdown: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            _ = shutdown.cancelled() => break,
            failure = failures.recv() => match failure {
                Some(failure) => failure,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.recover(failure).await;
    }
    debug!("reconnection supervisor stopped");
}

impl Inner {
    async fn recover(self: &Arc<Self>, failure: LinkFailure) {
        let LinkFailure { generation, error } = failure;
        if !self.retire_link(generation, &error).await {
            debug!(generation, error = %error, "ignoring failure from retired link");
            return;
        }
        // A failure while connecting is reported by `connect` itself.
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        warn!(generation, error = %error, kind = error.error_kind(), "connection lost");

        if !self.reconnect_allowed() || self.config.reconnect.max_attempts == 0 {
            if self
                .transition(&[ConnectionState::Connected], ConnectionState::Disconnected)
                .is_ok()
            {
                self.notify_connection_lost(error.to_string());
            }
            return;
        }
        if self
            .transition(&[ConnectionState::Connected], ConnectionState::Reconnecting)
            .is_err()
        {
            return;
        }
        self.reconnect_loop(error).await;
    }

    async fn reconnect_loop(self: &Arc<Self>, mut last_error: ClientError) {
        let settings = &self.config.reconnect;
        let backoff = Backoff::new(settings.base_delay, settings.max_delay);

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if self.reconnect_attempts.load(Ordering::SeqCst) >= settings.max_attempts
                || !self.reconnect_allowed()
            {
                break;
            }
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.reconnect_attempt();
            let delay = backoff.delay(attempt - 1);
            info!(
                attempt,
                max_attempts = settings.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            self.notify_reconnecting(ReconnectNotice {
                attempt,
                max_attempts: settings.max_attempts,
                delay,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.reconnect_allowed() {
                break;
            }

            let outcome = match self.establish().await {
                Ok(generation) => self
                    .promote(generation, ConnectionState::Reconnecting)
                    .await
                    .map(|()| generation),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(generation) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.stats.reconnected();
                    info!(generation, attempt, "reconnected");
                    self.replay().await;
                    self.notify_reconnected();
                    return;
                }
                Err(ClientError::Closed) => return,
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        retryable = e.is_retryable(),
                        "reconnect attempt failed"
                    );
                    self.teardown_current(&e).await;
                    let fatal = e.is_fatal();
                    last_error = e;
                    if fatal || self.state.get() != ConnectionState::Reconnecting {
                        break;
                    }
                    let _ = self.transition(
                        &[ConnectionState::Reconnecting],
                        ConnectionState::Reconnecting,
                    );
                }
            }
        }

        if self
            .transition(&[ConnectionState::Reconnecting], ConnectionState::Disconnected)
            .is_ok()
        {
            warn!(
                attempts = self.reconnect_attempts.load(Ordering::SeqCst),
                error = %last_error,
                "giving up on reconnection"
            );
            self.notify_connection_lost(last_error.to_string());
        }
    }

    /// Restore the current session, then the current workspace. A failing
    /// step clears only its own piece of state.
    async fn replay(&self) {
        let handle = self.session.read().clone();

        if let Some(session_id) = handle.session_id {
            let attach = AttachSession {
                session_id: session_id.clone(),
            };
            let outcome = match Frame::with_payload(FrameKind::SessionAttach, &attach) {
                Ok(frame) => self.request(frame).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => info!(session_id = %session_id, "session restored"),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "session restore failed");
                    let mut current = self.session.write();
                    if current.session_id.as_ref() == Some(&session_id) {
                        current.session_id = None;
                    }
                }
            }
        }

        if let Some(path) = handle.workspace {
            let set = SetWorkspace {
                path: path.clone(),
                session_id: self.session.read().session_id.clone(),
            };
            let outcome = match Frame::with_payload(FrameKind::WorkspaceSet, &set) {
                Ok(frame) => self.request(frame).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => info!(workspace = %path.display(), "workspace restored"),
                Err(e) => {
                    warn!(workspace = %path.display(), error = %e, "workspace restore failed");
                    let mut current = self.session.write();
                    if current.workspace.as_ref() == Some(&path) {
                        current.workspace = None;
                    }
                }
            }
        }
    }
}
