use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tron_core::ids::RequestId;
use tron_core::payloads::{CloseRequest, HandshakeRequest, HandshakeResponse};
use tron_core::{ClientError, Frame, FrameKind};

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::dispatch::{Callbacks, DispatchQueue};
use crate::keepalive;
use crate::pump::{enqueue, Pump, PumpEvents, PumpSettings};
use crate::reconnect;
use crate::session::SessionHandle;
use crate::state::{ConnectionState, StateCell, StateChange};
use crate::stats::ClientStats;
use crate::transport::{dial_with_timeout, Dialer, SocketDialer};

/// A link failure reported by a pump, tagged with the pump's generation.
#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub generation: u64,
    pub error: ClientError,
}

/// One live transport: the pump plus its keepalive.
struct Link {
    generation: u64,
    pump: Pump,
    keepalive: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl Link {
    async fn shutdown(self) {
        self.stop.cancel();
        self.pump.shutdown().await;
        if let Some(keepalive) = self.keepalive {
            let _ = keepalive.await;
        }
        debug!(generation = self.generation, "link torn down");
    }
}

/// Forwards pump observations into the client, tagged with the generation
/// that produced them.
struct LinkEvents {
    inner: Weak<Inner>,
    generation: u64,
}

impl PumpEvents for LinkEvents {
    fn on_frame(&self, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.route(self.generation, frame);
        }
    }

    fn on_failure(&self, error: ClientError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.report_failure(self.generation, error);
        }
    }

    fn on_dropped(&self, _error: &ClientError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stats.frame_dropped();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    pub(crate) state: StateCell,
    pub(crate) correlator: Correlator,
    pub(crate) callbacks: Arc<Callbacks>,
    pub(crate) dispatch: DispatchQueue,
    link: tokio::sync::Mutex<Option<Link>>,
    outgoing: RwLock<Option<mpsc::Sender<Frame>>>,
    generation: AtomicU64,
    reconnect_enabled: AtomicBool,
    pub(crate) reconnect_attempts: AtomicU32,
    pub(crate) session: RwLock<SessionHandle>,
    pub(crate) shutdown: CancellationToken,
    failures: mpsc::UnboundedSender<LinkFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkFailure>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    pub(crate) stats: ClientStats,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    /// Apply a validated transition and notify observers.
    pub(crate) fn transition(
        &self,
        expected: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<StateChange, ClientError> {
        let change = self.state.transition(expected, to)?;
        debug!(from = %change.from, to = %change.to, "state changed");
        self.notify_state(change);
        Ok(change)
    }

    pub(crate) fn reconnect_allowed(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    pub(crate) fn disable_reconnect(&self) {
        if self.reconnect_enabled.swap(false, Ordering::SeqCst) {
            info!("automatic reconnection disabled");
        }
    }

    pub(crate) fn outgoing_sender(&self) -> Option<mpsc::Sender<Frame>> {
        self.outgoing.read().clone()
    }

    fn sender(&self) -> Result<mpsc::Sender<Frame>, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.outgoing_sender().ok_or(ClientError::NotConnected)
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        match self.state.get() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(ClientError::Closed),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Enqueue without waiting for a reply. Ignores connection state.
    pub(crate) async fn post(&self, frame: Frame) -> Result<(), ClientError> {
        let tx = self.sender()?;
        enqueue(&tx, frame, self.config.write_timeout, &self.shutdown).await
    }

    /// Correlated round trip. Ignores connection state; the handshake and
    /// session replay run before the client counts as connected.
    pub(crate) async fn request(&self, mut frame: Frame) -> Result<Frame, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let id = frame
            .correlation_token()
            .cloned()
            .unwrap_or_else(RequestId::new);
        frame.request_id = Some(id.clone());

        let pending = self.correlator.register(id)?;
        let tx = self.sender()?;
        debug!(request_id = %pending.id(), kind = %frame.kind, "sending request");
        self.stats.request_sent();
        enqueue(&tx, frame, self.config.write_timeout, &self.shutdown).await?;

        let outcome = pending
            .wait(self.config.request_timeout, &self.shutdown)
            .await;
        self.stats.request_finished(&outcome);
        outcome
    }

    /// Queue a failure for the supervisor. Safe to call from pump tasks.
    /// Requests waiting on the live link fail immediately.
    pub(crate) fn report_failure(&self, generation: u64, error: ClientError) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if generation == self.current_generation() {
            self.correlator.fail_all(&error);
        }
        debug!(generation, error = %error, "link failure reported");
        let _ = self.failures.send(LinkFailure { generation, error });
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Dial, start a pump and perform the handshake.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<u64, ClientError> {
        let stream =
            dial_with_timeout(&*self.dialer, self.config.connect_timeout, &self.shutdown).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut link = self.link.lock().await;
            // Checked under the lock so `close` either sees this link or
            // we see its cancellation.
            if self.shutdown.is_cancelled() {
                return Err(ClientError::Closed);
            }
            if let Some(stale) = link.take() {
                stale.shutdown().await;
            }
            let stop = self.shutdown.child_token();
            let events = Arc::new(LinkEvents {
                inner: Arc::downgrade(self),
                generation,
            });
            let pump = Pump::start(
                stream,
                PumpSettings::from(&self.config),
                events,
                stop.clone(),
            );
            *self.outgoing.write() = Some(pump.sender());
            *link = Some(Link {
                generation,
                pump,
                keepalive: None,
                stop,
            });
        }
        debug!(generation, address = %self.config.address, "link up, handshaking");
        self.handshake().await?;
        Ok(generation)
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let request = HandshakeRequest {
            client_name: self.config.client_name.clone(),
            client_version: self.config.client_version.clone(),
            capabilities: self.config.capabilities.clone(),
            token: self
                .config
                .token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
        };
        let frame = Frame::with_payload(FrameKind::AuthRequest, &request)?;
        let response = match self.request(frame).await {
            Ok(response) => response,
            Err(ClientError::Server { message, .. }) => {
                return Err(ClientError::Authentication(message))
            }
            Err(e) => return Err(e),
        };
        let ack: HandshakeResponse = response.payload()?;
        if !ack.success {
            return Err(ClientError::Authentication(
                ack.message
                    .unwrap_or_else(|| "handshake rejected".to_string()),
            ));
        }
        info!(
            server_version = ack.server_version.as_deref().unwrap_or("unknown"),
            "handshake accepted"
        );
        Ok(())
    }

    /// Move to `Connected` only while `generation` is still the installed
    /// link, then start its heartbeat. Runs under the link lock, so a
    /// concurrent `retire_link` either wins and this fails, or runs after
    /// and sees `Connected`.
    pub(crate) async fn promote(
        &self,
        generation: u64,
        from: ConnectionState,
    ) -> Result<(), ClientError> {
        let mut link = self.link.lock().await;
        let Some(live) = link.as_mut().filter(|l| l.generation == generation) else {
            return Err(ClientError::Transport(
                "connection lost during handshake".into(),
            ));
        };
        self.transition(&[from], ConnectionState::Connected)?;
        let interval = self.config.heartbeat_interval;
        if !interval.is_zero() {
            live.keepalive = Some(keepalive::spawn(
                live.pump.sender(),
                interval,
                self.config.write_timeout,
                live.stop.clone(),
            ));
        }
        Ok(())
    }

    /// Tear down whatever link is installed and fail its pending requests.
    /// Holds the link lock until the pump has stopped.
    pub(crate) async fn teardown_current(&self, error: &ClientError) {
        let mut link = self.link.lock().await;
        self.outgoing.write().take();
        if let Some(link) = link.take() {
            link.shutdown().await;
        }
        self.correlator.fail_all(error);
    }

    /// Tear down the link only if `generation` is still the live one.
    pub(crate) async fn retire_link(&self, generation: u64, error: &ClientError) -> bool {
        let mut link = self.link.lock().await;
        if link.as_ref().map(|l| l.generation) != Some(generation) {
            return false;
        }
        self.outgoing.write().take();
        if let Some(link) = link.take() {
            link.shutdown().await;
        }
        self.correlator.fail_all(error);
        true
    }

    fn start_supervisor(self: &Arc<Self>) {
        let Some(rx) = self.failures_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(reconnect::supervise(
            Arc::downgrade(self),
            rx,
            self.shutdown.clone(),
        ));
        *self.supervisor.lock() = Some(handle);
    }
}

/// Client side of the daemon protocol.
///
/// Cheap to clone; all clones share one connection. Dropping the last clone
/// cancels every background task.
#[derive(Clone)]
pub struct DaemonClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("address", &self.inner.config.address)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl DaemonClient {
    pub fn new(config: ClientConfig) -> Self {
        let dialer = Arc::new(SocketDialer::new(config.address.clone()));
        Self::with_dialer(config, dialer)
    }

    /// Use a custom transport, e.g. [`crate::mock::MockDialer`].
    pub fn with_dialer(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let reconnect_enabled = config.reconnect.enabled;
        let dispatch = DispatchQueue::new(config.max_concurrent_callbacks);
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                state: StateCell::new(),
                correlator: Correlator::new(),
                callbacks: Arc::new(Callbacks::default()),
                dispatch,
                link: tokio::sync::Mutex::new(None),
                outgoing: RwLock::new(None),
                generation: AtomicU64::new(0),
                reconnect_enabled: AtomicBool::new(reconnect_enabled),
                reconnect_attempts: AtomicU32::new(0),
                session: RwLock::new(SessionHandle::default()),
                shutdown: CancellationToken::new(),
                failures,
                failures_rx: Mutex::new(Some(failures_rx)),
                supervisor: Mutex::new(None),
                stats: ClientStats::default(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Dial, handshake and move to `Connected`.
    ///
    /// Only valid from `Disconnected`. On failure the transport is torn
    /// down and the client returns to `Disconnected`; a rejected handshake
    /// yields [`ClientError::Authentication`] and is never retried.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        inner.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting)?;
        inner.start_supervisor();

        let outcome = match inner.establish().await {
            Ok(generation) => inner
                .promote(generation, ConnectionState::Connecting)
                .await
                .map(|()| generation),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(generation) => {
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                info!(generation, address = %inner.config.address, "connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "connect failed");
                inner.teardown_current(&e).await;
                let _ = inner.transition(
                    &[ConnectionState::Connecting],
                    ConnectionState::Disconnected,
                );
                Err(e)
            }
        }
    }

    /// Send a request and wait for its correlated response.
    pub async fn send_request(&self, frame: Frame) -> Result<Frame, ClientError> {
        self.inner.ensure_connected()?;
        self.inner.request(frame).await
    }

    /// Fire-and-forget send.
    pub async fn send_message(&self, frame: Frame) -> Result<(), ClientError> {
        self.inner.ensure_connected()?;
        self.inner.post(frame).await
    }

    /// Abrupt, idempotent shutdown. Returns once the pump, keepalive and
    /// supervisor have stopped; every pending request fails with `Closed`.
    pub async fn close(&self) {
        let inner = &self.inner;
        if let Some(change) = inner.state.close() {
            info!(from = %change.from, "closing client");
            // Delivered inline: the lifecycle lane is about to stop.
            if let Some(cb) = inner.callbacks.state_change_callback() {
                cb(change);
            }
        }
        inner.shutdown.cancel();
        inner.teardown_current(&ClientError::Closed).await;

        let supervisor = inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        inner.dispatch.shutdown();
    }

    /// Graceful shutdown: disable reconnection, tell the daemon to keep the
    /// session, wait briefly for its acknowledgement, then `close`.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.disable_reconnect();
        if inner.state.get() == ConnectionState::Connected {
            match Frame::with_payload(
                FrameKind::Close,
                &CloseRequest {
                    preserve_session: true,
                },
            ) {
                Ok(frame) => {
                    match tokio::time::timeout(inner.config.disconnect_grace, inner.request(frame))
                        .await
                    {
                        Ok(Ok(_)) => debug!("daemon acknowledged close"),
                        Ok(Err(e)) => debug!(error = %e, "close request failed"),
                        Err(_) => debug!("daemon did not acknowledge close in time"),
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode close request"),
            }
        }
        self.close().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    pub fn current_session(&self) -> SessionHandle {
        self.inner.session.read().clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect_enabled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ClientStats {
        &self.inner.stats
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}
