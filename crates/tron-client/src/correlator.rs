use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tron_core::ids::RequestId;
use tron_core::{ClientError, Frame, TimeoutKind};

type Slot = oneshot::Sender<Result<Frame, ClientError>>;

/// Outstanding requests keyed by correlation token.
///
/// Each slot is completed at most once: by the matching response, by
/// `fail_all` when the link stops, or removed by the waiter's guard on
/// timeout or cancellation.
#[derive(Default)]
pub(crate) struct Correlator {
    pending: DashMap<RequestId, Slot>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `id` before its frame is enqueued.
    pub(crate) fn register(&self, id: RequestId) -> Result<PendingRequest<'_>, ClientError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => Err(ClientError::Protocol(format!(
                "request id {id} is already outstanding"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingRequest {
                    correlator: self,
                    id,
                    rx: Some(rx),
                })
            }
        }
    }

    /// Deliver a response to its waiter. Returns the frame back when no
    /// waiter matches, so the caller can treat it as unsolicited.
    pub(crate) fn resolve(&self, frame: Frame) -> Result<(), Frame> {
        let Some(id) = frame.correlation_token() else {
            return Err(frame);
        };
        match self.pending.remove(id) {
            Some((_, slot)) => {
                // Waiter may have given up between lookup and send.
                let _ = slot.send(Ok(frame));
                Ok(())
            }
            None => Err(frame),
        }
    }

    /// Complete every outstanding request with `error`.
    pub(crate) fn fail_all(&self, error: &ClientError) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(error.clone()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// A registered request. Dropping it removes the table entry if it is
/// still this request's.
pub(crate) struct PendingRequest<'a> {
    correlator: &'a Correlator,
    id: RequestId,
    rx: Option<oneshot::Receiver<Result<Frame, ClientError>>>,
}

impl PendingRequest<'_> {
    pub(crate) fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response. An error block in the response becomes
    /// `ClientError::Server`.
    pub(crate) async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame, ClientError> {
        let Some(rx) = self.rx.take() else {
            return Err(ClientError::InvalidState("request already awaited".into()));
        };
        let outcome = tokio::select! {
            biased;
            res = rx => match res {
                Ok(res) => res,
                Err(_) => Err(ClientError::Closed),
            },
            _ = cancel.cancelled() => Err(ClientError::Closed),
            _ = tokio::time::sleep(timeout) => {
                Err(ClientError::timeout(TimeoutKind::Request, timeout))
            }
        };
        outcome?.into_result()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        // Only a slot whose receiver is gone is ours to remove; a live one
        // belongs to a later request that reused this token.
        drop(self.rx.take());
        self.correlator
            .pending
            .remove_if(&self.id, |_, slot| slot.is_closed());
    }
}
