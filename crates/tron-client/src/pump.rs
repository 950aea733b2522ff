//! Framed reader/writer pair over one daemon stream.
//!
//! The stream is split into two exclusively owned halves. The reader turns
//! newline-delimited JSON into [`Frame`]s and hands them to [`PumpEvents`];
//! the writer drains a bounded queue. Either side escalates I/O failures,
//! EOF and timeouts through `on_failure` and then exits.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tron_core::{ClientError, Frame, TimeoutKind};

use crate::config::ClientConfig;
use crate::transport::BoxedStream;

/// Sink for everything the pump observes.
pub(crate) trait PumpEvents: Send + Sync + 'static {
    fn on_frame(&self, frame: Frame);
    /// The link is unusable. Called at most once per loop.
    fn on_failure(&self, error: ClientError);
    /// A line was discarded without tearing down the link.
    fn on_dropped(&self, error: &ClientError);
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PumpSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
}

impl From<&ClientConfig> for PumpSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_frame_bytes: config.max_frame_bytes,
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

pub(crate) struct Pump {
    outgoing: mpsc::Sender<Frame>,
    stop: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Pump {
    pub(crate) fn start(
        stream: BoxedStream,
        settings: PumpSettings,
        events: Arc<dyn PumpEvents>,
        stop: CancellationToken,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, rx) = mpsc::channel(settings.queue_capacity);

        let lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(settings.max_frame_bytes),
        );
        let sink = FramedWrite::new(write_half, LinesCodec::new());

        let reader = tokio::spawn(read_loop(
            lines,
            settings.read_timeout,
            events.clone(),
            stop.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            settings.write_timeout,
            events,
            stop.clone(),
        ));

        Self {
            outgoing,
            stop,
            reader,
            writer,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Frame> {
        self.outgoing.clone()
    }

    /// Cancel both loops and wait until they have exited.
    pub(crate) async fn shutdown(self) {
        self.stop.cancel();
        drop(self.outgoing);
        if let Err(e) = self.reader.await {
            warn!(error = %e, "reader task ended abnormally");
        }
        if let Err(e) = self.writer.await {
            warn!(error = %e, "writer task ended abnormally");
        }
    }
}

async fn read_loop<R>(
    mut lines: FramedRead<R, LinesCodec>,
    read_timeout: Duration,
    events: Arc<dyn PumpEvents>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    // FramedRead yields a single `None` after a codec error before it
    // resumes reading; that one is not EOF.
    let mut resuming = false;
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = tokio::time::timeout(read_timeout, lines.next()) => next,
        };
        match next {
            Err(_) => {
                events.on_failure(ClientError::timeout(TimeoutKind::Read, read_timeout));
                return;
            }
            Ok(None) if resuming => {
                resuming = false;
            }
            Ok(None) => {
                events.on_failure(ClientError::Transport("connection closed by peer".into()));
                return;
            }
            Ok(Some(Ok(line))) => {
                resuming = false;
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::decode(&line) {
                    Ok(frame) => {
                        trace!(kind = %frame.kind, "frame received");
                        events.on_frame(frame);
                    }
                    Err(e) => {
                        warn!(error = %e, len = line.len(), "dropping malformed frame");
                        events.on_dropped(&e);
                    }
                }
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let e = ClientError::Protocol("frame exceeds maximum length".into());
                warn!(error = %e, "dropping oversized frame");
                events.on_dropped(&e);
                resuming = true;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                events.on_failure(e.into());
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    events: Arc<dyn PumpEvents>,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(kind = %frame.kind, error = %e, "dropping unencodable frame");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sink.send(line)).await {
            Ok(Ok(())) => trace!(kind = %frame.kind, "frame sent"),
            Ok(Err(e)) => {
                events.on_failure(ClientError::Transport(format!("write failed: {e}")));
                return;
            }
            Err(_) => {
                events.on_failure(ClientError::timeout(TimeoutKind::Write, write_timeout));
                return;
            }
        }
    }
    // Half-close so the daemon sees EOF promptly.
    let closed = tokio::time::timeout(write_timeout, SinkExt::<String>::close(&mut sink)).await;
    if closed.is_err() {
        debug!("write half did not close before timeout");
    }
}

/// Put `frame` on the outgoing queue. Blocks while the queue is full,
/// bounded by `write_timeout` and raced against `cancel`.
pub(crate) async fn enqueue(
    tx: &mpsc::Sender<Frame>,
    frame: Frame,
    write_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Closed),
        res = tokio::time::timeout(write_timeout, tx.send(frame)) => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Transport("outgoing queue closed".into())),
            Err(_) => Err(ClientError::timeout(TimeoutKind::Write, write_timeout)),
        },
    }
}
