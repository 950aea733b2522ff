use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tron_core::{Frame, FrameKind};

use crate::pump::enqueue;

/// Enqueue an uncorrelated `ping` every `interval` until `stop` fires or the
/// queue rejects a frame. The first tick is skipped.
pub(crate) fn spawn(
    outgoing: mpsc::Sender<Frame>,
    interval: Duration,
    write_timeout: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ping = Frame::new(FrameKind::Ping, serde_json::Value::Null);
            if let Err(e) = enqueue(&outgoing, ping, write_timeout, &stop).await {
                debug!(error = %e, "keepalive stopped");
                return;
            }
            trace!("keepalive ping queued");
        }
    })
}
