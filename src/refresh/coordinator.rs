//! Single-flight refresh of the access credential.
//!
//! At most one refresh call is in flight per coordinator. Every caller that
//! arrives while it runs joins the same cycle and observes the same outcome.
//! The check of the in-flight marker and the registration of a waiter happen
//! under one lock with no await in between.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RefreshFailure, RefreshRejected, TransportFailure};
use crate::refresh::queue::{Admission, PendingReplay, ReplayQueue};
use crate::security::AuditLogger;
use crate::session::SessionStore;
use crate::transport::{RequestDescriptor, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InFlight { cycle: u64, started: Instant },
}

/// The only mutable state shared between requests.
#[derive(Debug)]
pub(crate) struct RefreshState {
    pub(crate) phase: Phase,
    pub(crate) waiters: Vec<oneshot::Sender<Admission>>,
    pub(crate) queue: ReplayQueue,
    pub(crate) cycles: u64,
}

pub(crate) struct Shared<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) audit: AuditLogger,
    session: SessionStore,
    refresh_path: String,
    timeout: Duration,
    state: Mutex<RefreshState>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_cycle(self: Arc<Self>, cycle: u64) {
        let mut guard = SettleGuard {
            shared: Arc::clone(&self),
            cycle,
            armed: true,
        };

        let request = RequestDescriptor::post(self.refresh_path.as_str());
        let result = tokio::time::timeout(self.timeout, self.transport.send(&request)).await;

        let outcome = match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(TransportFailure::RefreshRejected { status })) => {
                Err(RefreshFailure::Rejected { status })
            }
            // only reachable if the transport does not know the refresh path
            Ok(Err(TransportFailure::AuthExpired { .. })) => {
                Err(RefreshFailure::Rejected { status: 401 })
            }
            Ok(Err(TransportFailure::Http { status, .. })) => {
                Err(RefreshFailure::UnexpectedStatus { status })
            }
            Ok(Err(TransportFailure::Network(msg))) => Err(RefreshFailure::Network(msg)),
            Err(_) => Err(RefreshFailure::TimedOut(self.timeout)),
        }
        .map_err(|reason| RefreshRejected { cycle, reason });

        match &outcome {
            Ok(()) => debug!(cycle, "access credential refreshed"),
            Err(err) => {
                warn!(cycle, error = %err, "refresh failed; clearing session");
                // waiters must observe the session already gone
                if let Err(e) = self.session.clear("refresh failed").await {
                    error!(cycle, error = %e, "failed to clear persisted session after refresh failure");
                }
            }
        }

        guard.armed = false;
        self.settle(cycle, outcome);
    }

    fn settle(&self, cycle: u64, outcome: Admission) {
        let (started, waiters, pending) = {
            let mut state = self.lock_state();
            let started = match state.phase {
                Phase::InFlight {
                    cycle: current,
                    started,
                } if current == cycle => started,
                _ => return,
            };
            state.phase = Phase::Idle;
            (started, std::mem::take(&mut state.waiters), state.queue.drain())
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let released = waiters.len() + pending.len();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        for request in pending {
            debug!(
                cycle,
                request_id = request.id(),
                waited_ms = request.waited().as_millis() as u64,
                "releasing parked request"
            );
            match &outcome {
                Ok(()) => request.admit(),
                Err(err) => request.reject(err.clone()),
            };
        }

        match &outcome {
            Ok(()) => self.audit.refresh_succeeded(cycle, elapsed_ms, released),
            Err(err) => self
                .audit
                .refresh_failed(cycle, &err.reason.to_string(), elapsed_ms, released),
        }
    }
}

// Settles the cycle as aborted if the refresh task is dropped or panics
// before reaching `settle`, so the coordinator never stays in flight.
struct SettleGuard<T: Transport> {
    shared: Arc<Shared<T>>,
    cycle: u64,
    armed: bool,
}

impl<T: Transport> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            warn!(cycle = self.cycle, "refresh task ended without settling");
            self.shared.settle(
                self.cycle,
                Err(RefreshRejected {
                    cycle: self.cycle,
                    reason: RefreshFailure::Aborted,
                }),
            );
        }
    }
}

/// Owned handle to the refresh state. Clones share one state, so one
/// coordinator must back every request of a client.
pub struct RefreshCoordinator<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for RefreshCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> RefreshCoordinator<T> {
    pub fn new(
        transport: Arc<T>,
        session: SessionStore,
        refresh_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                audit: AuditLogger::new(),
                session,
                refresh_path: refresh_path.into(),
                timeout,
                state: Mutex::new(RefreshState {
                    phase: Phase::Idle,
                    waiters: Vec::new(),
                    queue: ReplayQueue::new(),
                    cycles: 0,
                }),
            }),
        }
    }

    /// Make sure the access credential is fresh, sharing any refresh already
    /// in flight.
    ///
    /// A failed cycle has already cleared the session when this returns.
    pub async fn ensure_fresh(&self) -> Result<(), RefreshRejected> {
        let (receiver, cycle) = {
            let mut state = self.shared.lock_state();
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            (rx, self.begin_if_idle(&mut state))
        };

        receiver.await.unwrap_or(Err(RefreshRejected {
            cycle,
            reason: RefreshFailure::Aborted,
        }))
    }

    /// Park a request whose access credential expired. Starts a refresh cycle
    /// if none is running, otherwise joins the current one.
    pub fn park(&self, descriptor: RequestDescriptor) -> PendingReplay<T> {
        let mut state = self.shared.lock_state();
        let (id, receiver) = state.queue.push(descriptor.clone());
        let cycle = self.begin_if_idle(&mut state);
        drop(state);

        self.shared.audit.request_parked(
            id,
            descriptor.method().as_str(),
            descriptor.path(),
            cycle,
        );
        PendingReplay::new(id, cycle, descriptor, receiver, Arc::clone(&self.shared))
    }

    // Caller holds the state lock; the Idle -> InFlight edge is taken by exactly one caller.
    fn begin_if_idle(&self, state: &mut RefreshState) -> u64 {
        match state.phase {
            Phase::InFlight { cycle, .. } => cycle,
            Phase::Idle => {
                state.cycles += 1;
                let cycle = state.cycles;
                state.phase = Phase::InFlight {
                    cycle,
                    started: Instant::now(),
                };
                info!(cycle, "starting access credential refresh");
                self.shared.audit.refresh_started(cycle);
                tokio::spawn(Arc::clone(&self.shared).run_cycle(cycle));
                cycle
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.phase(), Phase::InFlight { .. })
    }

    /// Number of refresh cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.shared.lock_state().cycles
    }

    /// Requests currently parked on the in-flight cycle.
    pub fn pending_len(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn session(&self) -> &SessionStore {
        &self.shared.session
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::testing::FakeBackend;
    use crate::session::tests::sample_session;
    use crate::session::Role;

    fn coordinator(backend: &Arc<FakeBackend>, timeout: Duration) -> RefreshCoordinator<FakeBackend> {
        RefreshCoordinator::new(
            Arc::clone(backend),
            SessionStore::in_memory(),
            "/refresh",
            timeout,
        )
    }

    #[tokio::test]
    async fn concurrent_ensure_fresh_shares_one_refresh() {
        let backend = FakeBackend::gated();
        let coordinator = coordinator(&backend, Duration::from_secs(10));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move { c.ensure_fresh().await }));
        }
        backend.wait_for_refresh_calls(1).await;
        assert!(coordinator.is_refreshing());
        backend.release_refresh();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(coordinator.cycles(), 1);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn rejected_refresh_clears_session_for_every_waiter() {
        let backend = FakeBackend::rejecting();
        let coordinator = coordinator(&backend, Duration::from_secs(10));
        coordinator
            .session()
            .set(Some(sample_session("u1", Role::User)))
            .await
            .unwrap();

        let (a, b) = tokio::join!(coordinator.ensure_fresh(), coordinator.ensure_fresh());
        let expected = RefreshRejected {
            cycle: 1,
            reason: RefreshFailure::Rejected { status: 401 },
        };
        assert_eq!(a, Err(expected.clone()));
        assert_eq!(b, Err(expected));
        assert!(coordinator.session().get().await.is_none());
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn sequential_cycles_each_refresh_once() {
        let backend = FakeBackend::accepting();
        let coordinator = coordinator(&backend, Duration::from_secs(10));

        coordinator.ensure_fresh().await.unwrap();
        coordinator.ensure_fresh().await.unwrap();

        assert_eq!(backend.refresh_calls(), 2);
        assert_eq!(coordinator.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_refresh_times_out_and_fails_the_cycle() {
        let backend = FakeBackend::gated();
        let coordinator = coordinator(&backend, Duration::from_secs(5));
        coordinator
            .session()
            .set(Some(sample_session("u1", Role::User)))
            .await
            .unwrap();

        let pending = coordinator.park(RequestDescriptor::get("/me"));
        let err = coordinator.ensure_fresh().await.unwrap_err();

        assert_eq!(err.reason, RefreshFailure::TimedOut(Duration::from_secs(5)));
        assert!(!coordinator.is_refreshing());
        assert!(coordinator.session().get().await.is_none());
        assert!(matches!(
            pending.wait().await,
            Err(crate::error::RequestError::RefreshRejected(_))
        ));
        assert_eq!(backend.hits("/me"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_phase_records_when_the_cycle_started() {
        let backend = FakeBackend::gated();
        let coordinator = coordinator(&backend, Duration::from_secs(30));

        let _pending = coordinator.park(RequestDescriptor::get("/me"));
        tokio::time::advance(Duration::from_secs(3)).await;

        match coordinator.phase() {
            Phase::InFlight { cycle, started } => {
                assert_eq!(cycle, 1);
                assert!(started.elapsed() >= Duration::from_secs(3));
            }
            Phase::Idle => panic!("cycle settled while the refresh was gated"),
        }
    }

    #[tokio::test]
    async fn server_error_on_refresh_is_terminal() {
        let backend = FakeBackend::accepting();
        backend.set_refresh_status(503);
        let coordinator = coordinator(&backend, Duration::from_secs(10));

        let err = coordinator.ensure_fresh().await.unwrap_err();
        assert_eq!(err.reason, RefreshFailure::UnexpectedStatus { status: 503 });
    }

    #[tokio::test]
    async fn dropping_the_initiator_does_not_strand_the_cycle() {
        let backend = FakeBackend::gated();
        let coordinator = coordinator(&backend, Duration::from_secs(10));

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.ensure_fresh().await })
        };
        backend.wait_for_refresh_calls(1).await;
        first.abort();
        let _ = first.await;

        let joined = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.ensure_fresh().await })
        };
        tokio::task::yield_now().await;
        backend.release_refresh();

        assert_eq!(joined.await.unwrap(), Ok(()));
        assert_eq!(backend.refresh_calls(), 1);
    }
}
