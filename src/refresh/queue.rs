//! Replay queue: requests parked on an expired access credential.
//!
//! A parked request waits for the outcome of the refresh cycle it joined. The
//! coordinator drains the queue in arrival order with one shared outcome; each
//! admitted request then re-sends its descriptor exactly once, marked as a
//! replay, and the replays run concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RefreshFailure, RefreshRejected, RequestError, TransportFailure};
use crate::refresh::coordinator::Shared;
use crate::transport::{RequestDescriptor, Response, Transport};

/// Outcome of a refresh cycle as seen by one parked request.
pub(crate) type Admission = Result<(), RefreshRejected>;

/// A request waiting on a refresh cycle. Resolved or rejected exactly once:
/// both paths consume it.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    descriptor: RequestDescriptor,
    responder: oneshot::Sender<Admission>,
    enqueued_at: Instant,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Time spent parked so far.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Let the request replay. Returns `false` if its owner already went away.
    pub(crate) fn admit(self) -> bool {
        self.responder.send(Ok(())).is_ok()
    }

    pub(crate) fn reject(self, err: RefreshRejected) -> bool {
        self.responder.send(Err(err)).is_ok()
    }
}

/// Arrival-ordered set of parked requests. Owned by the coordinator's state.
#[derive(Debug, Default)]
pub struct ReplayQueue {
    pending: VecDeque<PendingRequest>,
    next_id: u64,
}

impl ReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, descriptor: RequestDescriptor) -> (u64, oneshot::Receiver<Admission>) {
        self.next_id += 1;
        let id = self.next_id;
        let (responder, receiver) = oneshot::channel();
        self.pending.push_back(PendingRequest {
            id,
            descriptor,
            responder,
            enqueued_at: Instant::now(),
        });
        (id, receiver)
    }

    /// Remove one entry without touching the others.
    pub(crate) fn cancel(&mut self, id: u64) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|p| p.id == id)?;
        self.pending.remove(index)
    }

    /// Take every entry, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.pending.iter().map(|p| p.id).collect()
    }
}

/// Caller-side handle for a parked request.
///
/// Await [`PendingReplay::wait`] for the replayed response. Dropping the
/// handle, or calling [`PendingReplay::cancel`], removes the request from the
/// queue; the refresh cycle and every other parked request are unaffected.
pub struct PendingReplay<T: Transport> {
    id: u64,
    cycle: u64,
    descriptor: RequestDescriptor,
    receiver: oneshot::Receiver<Admission>,
    shared: Arc<Shared<T>>,
}

impl<T: Transport> PendingReplay<T> {
    pub(crate) fn new(
        id: u64,
        cycle: u64,
        descriptor: RequestDescriptor,
        receiver: oneshot::Receiver<Admission>,
        shared: Arc<Shared<T>>,
    ) -> Self {
        Self {
            id,
            cycle,
            descriptor,
            receiver,
            shared,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Refresh cycle this request joined.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Wait for the cycle to settle, then replay once.
    pub async fn wait(mut self) -> Result<Response, RequestError> {
        let admission = match (&mut self.receiver).await {
            Ok(admission) => admission,
            Err(_) => Err(RefreshRejected {
                cycle: self.cycle,
                reason: RefreshFailure::Aborted,
            }),
        };

        if let Err(err) = admission {
            debug!(
                request_id = self.id,
                path = %self.descriptor.path(),
                error = %err,
                "parked request rejected by refresh outcome"
            );
            return Err(err.into());
        }

        let replay = self.descriptor.as_replay();
        match self.shared.transport.send(&replay).await {
            Ok(response) => {
                self.shared.audit.request_replayed(
                    self.id,
                    replay.path(),
                    response.status().as_u16(),
                );
                Ok(response)
            }
            Err(TransportFailure::AuthExpired { path }) => {
                // stale right after a successful refresh: do not go around again
                warn!(
                    request_id = self.id,
                    path = %path,
                    cycle = self.cycle,
                    "replayed request still unauthorized after refresh"
                );
                self.shared.audit.replay_rejected(self.id, &path);
                Err(TransportFailure::AuthExpired { path }.into())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Withdraw the request. Returns `true` if it was still waiting.
    pub fn cancel(self) -> bool {
        self.withdraw()
    }

    fn withdraw(&self) -> bool {
        let removed = self.shared.lock_state().queue.cancel(self.id);
        match removed {
            Some(pending) => {
                self.shared
                    .audit
                    .request_cancelled(pending.id(), pending.descriptor().path());
                true
            }
            None => false,
        }
    }
}

impl<T: Transport> Drop for PendingReplay<T> {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl<T: Transport> std::fmt::Debug for PendingReplay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplay")
            .field("id", &self.id)
            .field("cycle", &self.cycle)
            .field("path", &self.descriptor.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_preserves_arrival_order() {
        let mut queue = ReplayQueue::new();
        let (a, _ra) = queue.push(RequestDescriptor::get("/a"));
        let (b, _rb) = queue.push(RequestDescriptor::get("/b"));
        let (c, _rc) = queue.push(RequestDescriptor::get("/c"));

        let drained: Vec<u64> = queue.drain().iter().map(|p| p.id()).collect();
        assert_eq!(drained, vec![a, b, c]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_only_the_target() {
        let mut queue = ReplayQueue::new();
        let (a, _ra) = queue.push(RequestDescriptor::get("/a"));
        let (b, _rb) = queue.push(RequestDescriptor::get("/b"));

        let removed = queue.cancel(a).unwrap();
        assert_eq!(removed.descriptor().path(), "/a");
        assert!(queue.cancel(a).is_none());
        assert_eq!(queue.ids(), vec![b]);
    }

    #[tokio::test]
    async fn admit_and_reject_reach_the_receiver() {
        let mut queue = ReplayQueue::new();
        let (_, admitted) = queue.push(RequestDescriptor::get("/a"));
        let (_, rejected) = queue.push(RequestDescriptor::get("/b"));
        let mut drained = queue.drain().into_iter();

        assert!(drained.next().unwrap().admit());
        let err = RefreshRejected {
            cycle: 1,
            reason: RefreshFailure::Rejected { status: 401 },
        };
        assert!(drained.next().unwrap().reject(err.clone()));

        assert_eq!(admitted.await.unwrap(), Ok(()));
        assert_eq!(rejected.await.unwrap(), Err(err));
    }

    #[tokio::test(start_paused = true)]
    async fn waited_counts_time_spent_parked() {
        let mut queue = ReplayQueue::new();
        let (_, _receiver) = queue.push(RequestDescriptor::get("/a"));
        tokio::time::advance(Duration::from_secs(2)).await;

        let pending = queue.drain().pop().unwrap();
        assert!(pending.waited() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn admit_reports_a_gone_owner() {
        let mut queue = ReplayQueue::new();
        let (_, receiver) = queue.push(RequestDescriptor::get("/a"));
        drop(receiver);

        let pending = queue.drain().pop().unwrap();
        assert!(pending.waited() < Duration::from_secs(5));
        assert!(!pending.admit());
    }
}
