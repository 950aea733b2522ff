//! Callback registry, per-stream delivery lanes and routing of
//! unsolicited frames.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use tron_core::ids::RequestId;
use tron_core::payloads::{
    AuthorizationAck, AuthorizationDecision, AuthorizationRequest, AuthorizationResponse,
    ChatComplete, ChatMessage, ClosedNotice, Progress, QuestionAnswer, QuestionRequest,
    QuestionResponse, ToolCall, ToolResult,
};
use tron_core::{ClientError, Frame, FrameKind};

use crate::client::Inner;
use crate::state::StateChange;

/// Decides daemon authorization requests.
#[async_trait]
pub trait AuthorizationHandler: Send + Sync + 'static {
    async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationDecision, ClientError>;
}

/// Answers daemon questions.
#[async_trait]
pub trait QuestionHandler: Send + Sync + 'static {
    async fn answer(&self, request: QuestionRequest) -> Result<QuestionAnswer, ClientError>;
}

/// Emitted before each reconnection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectNotice {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Slot<T> {
    callback: RwLock<Option<Callback<T>>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }
}

impl<T> Slot<T> {
    fn set(&self, f: impl Fn(T) + Send + Sync + 'static) {
        *self.callback.write() = Some(Arc::new(f));
    }

    fn get(&self) -> Option<Callback<T>> {
        self.callback.read().clone()
    }
}

/// One slot per event kind. Registering replaces any previous callback.
///
/// Callbacks run on dispatcher lanes, never on the reader task. Events
/// sharing a stream (one session, one authorization) are delivered in
/// arrival order; distinct streams may run concurrently.
#[derive(Default)]
pub struct Callbacks {
    chat_message: Slot<ChatMessage>,
    chat_complete: Slot<ChatComplete>,
    tool_call: Slot<ToolCall>,
    tool_result: Slot<ToolResult>,
    progress: Slot<Progress>,
    state_change: Slot<StateChange>,
    reconnecting: Slot<ReconnectNotice>,
    reconnected: Slot<()>,
    connection_lost: Slot<String>,
    authorization: RwLock<Option<Arc<dyn AuthorizationHandler>>>,
    question: RwLock<Option<Arc<dyn QuestionHandler>>>,
}

impl Callbacks {
    pub fn on_chat_message(&self, f: impl Fn(ChatMessage) + Send + Sync + 'static) {
        self.chat_message.set(f);
    }

    pub fn on_chat_complete(&self, f: impl Fn(ChatComplete) + Send + Sync + 'static) {
        self.chat_complete.set(f);
    }

    pub fn on_tool_call(&self, f: impl Fn(ToolCall) + Send + Sync + 'static) {
        self.tool_call.set(f);
    }

    pub fn on_tool_result(&self, f: impl Fn(ToolResult) + Send + Sync + 'static) {
        self.tool_result.set(f);
    }

    pub fn on_progress(&self, f: impl Fn(Progress) + Send + Sync + 'static) {
        self.progress.set(f);
    }

    pub fn on_state_change(&self, f: impl Fn(StateChange) + Send + Sync + 'static) {
        self.state_change.set(f);
    }

    pub fn on_reconnecting(&self, f: impl Fn(ReconnectNotice) + Send + Sync + 'static) {
        self.reconnecting.set(f);
    }

    pub fn on_reconnected(&self, f: impl Fn(()) + Send + Sync + 'static) {
        self.reconnected.set(f);
    }

    /// Reconnection gave up or was not allowed. Receives the final error text.
    pub fn on_connection_lost(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.connection_lost.set(f);
    }

    pub fn set_authorization_handler(&self, handler: Arc<dyn AuthorizationHandler>) {
        *self.authorization.write() = Some(handler);
    }

    pub fn set_question_handler(&self, handler: Arc<dyn QuestionHandler>) {
        *self.question.write() = Some(handler);
    }

    fn authorization_handler(&self) -> Option<Arc<dyn AuthorizationHandler>> {
        self.authorization.read().clone()
    }

    fn question_handler(&self) -> Option<Arc<dyn QuestionHandler>> {
        self.question.read().clone()
    }

    pub(crate) fn state_change_callback(&self) -> Option<Arc<dyn Fn(StateChange) + Send + Sync>> {
        self.state_change.get()
    }
}

type Job = BoxFuture<'static, ()>;
type Lanes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>;

/// Keyed lane executor. Jobs with the same key run one at a time in
/// submission order; lanes exit when drained.
pub(crate) struct DispatchQueue {
    lanes: Lanes,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl DispatchQueue {
    pub(crate) fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            limit: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn submit<F>(&self, key: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        let key = key.into();
        let mut job: Job = Box::pin(job);
        let mut lanes = self.lanes.lock();
        if let Some(tx) = lanes.get(&key) {
            match tx.send(job) {
                Ok(()) => return,
                // Lane died (panic or cancel); start a fresh one.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, cannot fail.
        let _ = tx.send(job);
        lanes.insert(key.clone(), tx);
        drop(lanes);

        self.tracker.spawn(run_lane(
            key,
            rx,
            self.lanes.clone(),
            self.limit.clone(),
            self.cancel.clone(),
        ));
    }

    /// Cancel every lane. Does not wait for running callbacks, which may
    /// themselves be calling into the client.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.lanes.lock().clear();
    }
}

async fn run_lane(
    key: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    lanes: Lanes,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Retire under the map lock so no submission lands in a
                // receiver nobody drains.
                let mut map = lanes.lock();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        map.remove(&key);
                        trace!(lane = %key, "lane drained");
                        return;
                    }
                }
            }
        };

        let _permit = match &limit {
            Some(sem) => tokio::select! {
                _ = cancel.cancelled() => return,
                permit = sem.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            res = AssertUnwindSafe(job).catch_unwind() => {
                if res.is_err() {
                    warn!(lane = %key, "callback panicked");
                }
            }
        }
    }
}

fn session_lane(frame: &Frame) -> String {
    match frame.data.get("session_id").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => format!("session:{id}"),
        _ => "session:-".to_string(),
    }
}

const LIFECYCLE_LANE: &str = "lifecycle";

impl Inner {
    /// Route a frame the reader produced. Responses go to their waiter;
    /// everything else is unsolicited.
    pub(crate) fn route(self: &Arc<Self>, generation: u64, frame: Frame) {
        let frame = match self.correlator.resolve(frame) {
            Ok(()) => return,
            Err(frame) => frame,
        };
        match frame.kind {
            FrameKind::ChatMessage => self.deliver(&frame, &self.callbacks.chat_message),
            FrameKind::ChatComplete => self.deliver(&frame, &self.callbacks.chat_complete),
            FrameKind::ToolCall => self.deliver(&frame, &self.callbacks.tool_call),
            FrameKind::ToolResult => self.deliver(&frame, &self.callbacks.tool_result),
            FrameKind::Progress => self.deliver(&frame, &self.callbacks.progress),
            FrameKind::AuthorizationRequest => self.on_authorization_request(&frame),
            FrameKind::QuestionRequest => self.on_question_request(&frame),
            FrameKind::Pong => self.stats.pong(),
            FrameKind::Ping => self.answer_ping(&frame),
            FrameKind::Closed => self.on_closed(generation, &frame),
            ref kind => debug!(kind = %kind, "ignoring unhandled frame"),
        }
    }

    fn deliver<T>(&self, frame: &Frame, slot: &Slot<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(callback) = slot.get() else {
            trace!(kind = %frame.kind, "no callback registered");
            return;
        };
        let payload: T = match frame.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "dropping undecodable event");
                self.stats.frame_dropped();
                return;
            }
        };
        self.dispatch
            .submit(session_lane(frame), async move { callback(payload) });
    }

    fn on_authorization_request(self: &Arc<Self>, frame: &Frame) {
        let request: AuthorizationRequest = match frame.payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable authorization request");
                self.stats.frame_dropped();
                return;
            }
        };
        let id = request.authorization_id.clone();
        let token = RequestId::from(&id);

        // Acknowledge from the reader path when the queue has room;
        // otherwise the lane sends it before running the handler.
        let ack = match Frame::with_payload(
            FrameKind::AuthorizationAck,
            &AuthorizationAck {
                authorization_id: id.clone(),
            },
        ) {
            Ok(ack) => ack.with_request_id(token.clone()),
            Err(e) => {
                warn!(error = %e, "failed to encode authorization ack");
                return;
            }
        };
        let deferred_ack = match self.outgoing_sender() {
            Some(tx) => match tx.try_send(ack) {
                Ok(()) => None,
                Err(TrySendError::Full(ack)) => Some(ack),
                Err(TrySendError::Closed(_)) => return,
            },
            None => return,
        };

        let weak = Arc::downgrade(self);
        let handler = self.callbacks.authorization_handler();
        self.dispatch.submit(format!("authorization:{id}"), async move {
            if let Some(ack) = deferred_ack {
                if !post_weak(&weak, ack).await {
                    return;
                }
            }
            let decision = match handler {
                Some(handler) => {
                    match AssertUnwindSafe(handler.authorize(request)).catch_unwind().await {
                        Ok(Ok(decision)) => decision,
                        Ok(Err(e)) => {
                            warn!(authorization_id = %id, error = %e, "authorization handler failed");
                            AuthorizationDecision::deny(format!("handler failed: {e}"))
                        }
                        Err(_) => {
                            warn!(authorization_id = %id, "authorization handler panicked");
                            AuthorizationDecision::deny("handler failed")
                        }
                    }
                }
                None => AuthorizationDecision::deny("no authorization handler registered"),
            };
            info!(authorization_id = %id, approved = decision.approved, "authorization decided");
            let response = AuthorizationResponse::new(id, decision);
            match Frame::with_payload(FrameKind::AuthorizationResponse, &response) {
                Ok(frame) => {
                    post_weak(&weak, frame.with_request_id(token)).await;
                }
                Err(e) => warn!(error = %e, "failed to encode authorization response"),
            }
        });
    }

    fn on_question_request(self: &Arc<Self>, frame: &Frame) {
        let request: QuestionRequest = match frame.payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable question request");
                self.stats.frame_dropped();
                return;
            }
        };
        let id = request.question_id.clone();
        let weak = Arc::downgrade(self);
        let handler = self.callbacks.question_handler();
        self.dispatch.submit(format!("question:{id}"), async move {
            let response = match handler {
                Some(handler) => {
                    match AssertUnwindSafe(handler.answer(request.clone())).catch_unwind().await {
                        Ok(Ok(answer)) => QuestionResponse::from_answer(&request, answer),
                        Ok(Err(e)) => {
                            warn!(question_id = %id, error = %e, "question handler failed");
                            QuestionResponse::empty(&request)
                        }
                        Err(_) => {
                            warn!(question_id = %id, "question handler panicked");
                            QuestionResponse::empty(&request)
                        }
                    }
                }
                None => QuestionResponse::empty(&request),
            };
            match Frame::with_payload(FrameKind::QuestionResponse, &response) {
                Ok(frame) => {
                    post_weak(&weak, frame.with_request_id(RequestId::from(&id))).await;
                }
                Err(e) => warn!(error = %e, "failed to encode question response"),
            }
        });
    }

    fn answer_ping(&self, frame: &Frame) {
        let mut pong = Frame::new(FrameKind::Pong, serde_json::Value::Null);
        pong.request_id = frame.correlation_token().cloned();
        if let Some(tx) = self.outgoing_sender() {
            if tx.try_send(pong).is_err() {
                debug!("outgoing queue full, skipping pong");
            }
        }
    }

    fn on_closed(&self, generation: u64, frame: &Frame) {
        let notice: ClosedNotice = match frame.payload() {
            Ok(notice) => notice,
            Err(e) => {
                // The link is still going away; treat it as a plain close.
                warn!(error = %e, "undecodable closed notice, assuming reconnect");
                self.stats.frame_dropped();
                ClosedNotice {
                    reason: String::new(),
                    reconnect: true,
                }
            }
        };
        if !notice.reconnect {
            self.disable_reconnect();
        }
        info!(reason = %notice.reason, reconnect = notice.reconnect, "daemon closed the connection");
        let reason = if notice.reason.is_empty() {
            "daemon closed the connection".to_string()
        } else {
            format!("daemon closed the connection: {}", notice.reason)
        };
        self.report_failure(generation, ClientError::Transport(reason));
    }

    pub(crate) fn notify_state(&self, change: StateChange) {
        if let Some(cb) = self.callbacks.state_change.get() {
            self.dispatch.submit(LIFECYCLE_LANE, async move { cb(change) });
        }
    }

    pub(crate) fn notify_reconnecting(&self, notice: ReconnectNotice) {
        if let Some(cb) = self.callbacks.reconnecting.get() {
            self.dispatch.submit(LIFECYCLE_LANE, async move { cb(notice) });
        }
    }

    pub(crate) fn notify_reconnected(&self) {
        if let Some(cb) = self.callbacks.reconnected.get() {
            self.dispatch.submit(LIFECYCLE_LANE, async move { cb(()) });
        }
    }

    pub(crate) fn notify_connection_lost(&self, reason: String) {
        if let Some(cb) = self.callbacks.connection_lost.get() {
            self.dispatch.submit(LIFECYCLE_LANE, async move { cb(reason) });
        }
    }
}

async fn post_weak(inner: &Weak<Inner>, frame: Frame) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    match inner.post(frame).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to send reply");
            false
        }
    }
}
