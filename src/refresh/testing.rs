//! In-process backend double for coordinator and pipeline tests.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::TransportFailure;
use crate::transport::{Classifier, RequestDescriptor, Response, Transport};

const OPEN: usize = 1 << 20;

/// Protected paths answer 401 while the credential is stale. The refresh
/// path waits on a gate, then answers `refresh_status` and, on success,
/// makes the credential valid again.
#[derive(Debug)]
pub(crate) struct FakeBackend {
    classifier: Classifier,
    credential_valid: AtomicBool,
    stay_stale: AtomicBool,
    refresh_status: AtomicU16,
    refresh_calls: AtomicUsize,
    gate: Semaphore,
    hits: Mutex<HashMap<String, usize>>,
    replays: Mutex<HashMap<String, usize>>,
    fixed: Mutex<HashMap<String, u16>>,
}

impl FakeBackend {
    fn build(refresh_status: u16, gate_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            classifier: Classifier::new("/refresh"),
            credential_valid: AtomicBool::new(true),
            stay_stale: AtomicBool::new(false),
            refresh_status: AtomicU16::new(refresh_status),
            refresh_calls: AtomicUsize::new(0),
            gate: Semaphore::new(gate_permits),
            hits: Mutex::new(HashMap::new()),
            replays: Mutex::new(HashMap::new()),
            fixed: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn accepting() -> Arc<Self> {
        Self::build(200, OPEN)
    }

    pub(crate) fn rejecting() -> Arc<Self> {
        Self::build(401, OPEN)
    }

    /// Refresh calls block until [`FakeBackend::release_refresh`].
    pub(crate) fn gated() -> Arc<Self> {
        Self::build(200, 0)
    }

    pub(crate) fn release_refresh(&self) {
        self.gate.add_permits(OPEN);
    }

    pub(crate) fn expire(&self) {
        self.credential_valid.store(false, Ordering::SeqCst);
    }

    /// Refresh answers success but the credential stays stale.
    pub(crate) fn keep_stale_after_refresh(&self) {
        self.stay_stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_refresh_status(&self, status: u16) {
        self.refresh_status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn respond_with(&self, path: &str, status: u16) {
        self.fixed.lock().unwrap().insert(path.to_string(), status);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub(crate) fn replays(&self, path: &str) -> usize {
        self.replays.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub(crate) async fn wait_for_refresh_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.refresh_calls() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("refresh call never arrived");
    }

    fn respond(&self, path: &str, status: u16) -> Result<Response, TransportFailure> {
        let status = StatusCode::from_u16(status).unwrap();
        let body = serde_json::json!({ "path": path }).to_string().into_bytes();
        match self.classifier.classify(path, status, &body) {
            None => Ok(Response::new(status, HeaderMap::new(), body)),
            Some(failure) => Err(failure),
        }
    }
}

impl Transport for FakeBackend {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure> {
        let path = request.path().to_string();
        *self.hits.lock().unwrap().entry(path.clone()).or_default() += 1;
        if request.is_replay() {
            *self.replays.lock().unwrap().entry(path.clone()).or_default() += 1;
        }

        if self.classifier.is_refresh_path(&path) {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            let status = self.refresh_status.load(Ordering::SeqCst);
            if (200..300).contains(&status) && !self.stay_stale.load(Ordering::SeqCst) {
                self.credential_valid.store(true, Ordering::SeqCst);
            }
            return self.respond(&path, status);
        }

        let fixed = self.fixed.lock().unwrap().get(&path).copied();
        if let Some(status) = fixed {
            return self.respond(&path, status);
        }
        if !self.credential_valid.load(Ordering::SeqCst) {
            return self.respond(&path, 401);
        }
        self.respond(&path, 200)
    }
}

/// Yield until `cond` holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition never held");
}
