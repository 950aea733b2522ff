//! In-memory daemon for deterministic tests without a real socket.
//!
//! [`MockDialer`] hands the client one end of a `tokio::io::duplex` pipe
//! per dial and publishes the other end as a [`MockPeer`] on the paired
//! [`MockListener`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tron_core::payloads::{ClosedNotice, HandshakeRequest};
use tron_core::{ClientError, Frame, FrameKind};

use crate::transport::{BoxedStream, Dialer};

const PIPE_CAPACITY: usize = 64 * 1024;

struct DialerState {
    fail_next: AtomicU32,
    refuse_all: AtomicBool,
    stall: AtomicBool,
    dials: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Scriptable dialer. Clones share one script.
#[derive(Clone)]
pub struct MockDialer {
    state: Arc<DialerState>,
}

/// Receives the daemon side of every successful dial.
pub struct MockListener {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockDialer {
    pub fn new() -> (Self, MockListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            state: Arc::new(DialerState {
                fail_next: AtomicU32::new(0),
                refuse_all: AtomicBool::new(false),
                stall: AtomicBool::new(false),
                dials: AtomicUsize::new(0),
                peers: tx,
            }),
        };
        (dialer, MockListener { peers: rx })
    }

    /// Refuse the next `n` dials.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every dial until reset.
    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Never complete a dial until reset.
    pub fn stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::SeqCst);
    }

    /// Total dials attempted, including refused ones.
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let state = &self.state;
        state.dials.fetch_add(1, Ordering::SeqCst);
        if state.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let scripted_failure = state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || state.refuse_all.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock daemon refused connection",
            ));
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        state
            .peers
            .send(MockPeer::new(server))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "mock listener dropped"))?;
        Ok(Box::new(client))
    }
}

impl MockListener {
    /// Next accepted connection, or `None` once every dialer is gone.
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.peers.recv().await
    }

    /// Accept and complete the handshake.
    pub async fn accept_ready(&mut self) -> Option<MockPeer> {
        let mut peer = self.accept().await?;
        peer.accept_handshake().await?;
        Some(peer)
    }
}

/// Daemon end of one mock connection.
pub struct MockPeer {
    lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    sink: FramedWrite<WriteHalf<DuplexStream>, LinesCodec>,
}

impl MockPeer {
    fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            lines: FramedRead::new(read, LinesCodec::new()),
            sink: FramedWrite::new(write, LinesCodec::new()),
        }
    }

    /// Next frame from the client, or `None` on EOF.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let line = self.lines.next().await?.ok()?;
            match Frame::decode(&line) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(error = %e, "mock peer skipping bad line"),
            }
        }
    }

    /// Next frame that is not a keepalive `ping`.
    pub async fn recv_request(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            if frame.kind == FrameKind::Ping && frame.request_id.is_none() {
                continue;
            }
            return Some(frame);
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        self.send_raw(&frame.encode()?).await
    }

    /// Write one line verbatim, e.g. malformed JSON.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), ClientError> {
        self.sink
            .send(line)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Answer `request` with a success response carrying `data`.
    pub async fn reply(&mut self, request: &Frame, data: Value) -> Result<(), ClientError> {
        let Some(id) = request.correlation_token().cloned() else {
            return Err(ClientError::Protocol("request has no correlation token".into()));
        };
        self.send(&Frame::response(id, response_kind(&request.kind), data))
            .await
    }

    /// Answer `request` with an error block.
    pub async fn reply_error(
        &mut self,
        request: &Frame,
        code: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let Some(id) = request.correlation_token().cloned() else {
            return Err(ClientError::Protocol("request has no correlation token".into()));
        };
        self.send(&Frame::error_response(
            id,
            response_kind(&request.kind),
            code,
            message,
        ))
        .await
    }

    /// Read the `auth_request` and accept it.
    pub async fn accept_handshake(&mut self) -> Option<HandshakeRequest> {
        let request = self.recv_request().await?;
        if request.kind != FrameKind::AuthRequest {
            return None;
        }
        let hello: HandshakeRequest = request.payload().ok()?;
        self.reply(&request, json!({"success": true, "server_version": "mock"}))
            .await
            .ok()?;
        Some(hello)
    }

    /// Read the `auth_request` and refuse it.
    pub async fn reject_handshake(&mut self, message: &str) -> Option<HandshakeRequest> {
        let request = self.recv_request().await?;
        let hello: HandshakeRequest = request.payload().ok()?;
        self.reply(&request, json!({"success": false, "message": message}))
            .await
            .ok()?;
        Some(hello)
    }

    /// Announce server-side termination.
    pub async fn send_closed(&mut self, reason: &str, reconnect: bool) -> Result<(), ClientError> {
        let notice = ClosedNotice {
            reason: reason.to_string(),
            reconnect,
        };
        self.send(&Frame::with_payload(FrameKind::Closed, &notice)?)
            .await
    }
}

fn response_kind(kind: &FrameKind) -> FrameKind {
    match kind {
        FrameKind::AuthRequest => FrameKind::AuthResponse,
        FrameKind::Ping => FrameKind::Pong,
        FrameKind::Close => FrameKind::Closed,
        other => other.clone(),
    }
}
