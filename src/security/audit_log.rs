use tracing::{info, warn};

/// Structured audit events for the session lifecycle, emitted on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn session_restored(&self, user_id: &str, role: &str) {
        info!(target: "audit", event = "session_restored", user_id, role);
    }

    pub fn session_restore_failed(&self, reason: &str) {
        warn!(target: "audit", event = "session_restore_failed", reason);
    }

    pub fn session_committed(&self, user_id: &str, role: &str) {
        info!(target: "audit", event = "session_committed", user_id, role);
    }

    pub fn session_cleared(&self, user_id: Option<&str>, reason: &str) {
        info!(target: "audit", event = "session_cleared", user_id = user_id.unwrap_or(""), reason);
    }

    pub fn refresh_started(&self, cycle: u64) {
        info!(target: "audit", event = "refresh_started", cycle);
    }

    pub fn refresh_succeeded(&self, cycle: u64, elapsed_ms: u64, released: usize) {
        info!(target: "audit", event = "refresh_succeeded", cycle, elapsed_ms, released);
    }

    pub fn refresh_failed(&self, cycle: u64, reason: &str, elapsed_ms: u64, rejected: usize) {
        warn!(target: "audit", event = "refresh_failed", cycle, reason, elapsed_ms, rejected);
    }

    pub fn request_parked(&self, request_id: u64, method: &str, path: &str, cycle: u64) {
        info!(target: "audit", event = "request_parked", request_id, method, path, cycle);
    }

    pub fn request_replayed(&self, request_id: u64, path: &str, status: u16) {
        info!(target: "audit", event = "request_replayed", request_id, path, status);
    }

    pub fn request_cancelled(&self, request_id: u64, path: &str) {
        info!(target: "audit", event = "request_cancelled", request_id, path);
    }

    pub fn replay_rejected(&self, request_id: u64, path: &str) {
        warn!(target: "audit", event = "replay_rejected", request_id, path);
    }
}
