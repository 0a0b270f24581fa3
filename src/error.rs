//! Error taxonomy for the request layer.
//!
//! Every error here is `Clone`: one refresh outcome is fanned out to every
//! request parked on the same cycle.

use std::time::Duration;
use thiserror::Error;

/// Classified outcome of a single transport round trip that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// No response reached the client.
    #[error("network failure: {0}")]
    Network(String),

    /// The access credential is stale for a request that is not the refresh call.
    #[error("access credential expired for {path}")]
    AuthExpired { path: String },

    /// The refresh endpoint itself refused the refresh credential.
    #[error("refresh credential rejected (HTTP {status})")]
    RefreshRejected { status: u16 },

    /// Any other non-2xx response. Passed through untouched.
    #[error("HTTP {status} for {path}")]
    Http {
        status: u16,
        path: String,
        body: String,
    },
}

/// Why a refresh cycle failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("refresh endpoint answered {status}")]
    Rejected { status: u16 },

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("refresh could not reach the server: {0}")]
    Network(String),

    #[error("refresh endpoint answered unexpected status {status}")]
    UnexpectedStatus { status: u16 },

    /// The task driving the refresh went away before settling.
    #[error("refresh cycle aborted")]
    Aborted,
}

/// Terminal failure of one refresh cycle, shared by every waiter of that cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("refresh cycle {cycle} failed: {reason}")]
pub struct RefreshRejected {
    pub cycle: u64,
    pub reason: RefreshFailure,
}

/// Errors surfaced to callers of [`crate::client::AuthClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    #[error(transparent)]
    RefreshRejected(#[from] RefreshRejected),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The operation needs a session and none is present.
    #[error("no active session")]
    NoSession,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("session storage error: {0}")]
    Storage(String),
}

impl RequestError {
    /// HTTP status carried by the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Transport(TransportFailure::AuthExpired { .. }) => Some(401),
            RequestError::Transport(TransportFailure::RefreshRejected { status }) => Some(*status),
            RequestError::Transport(TransportFailure::Http { status, .. }) => Some(*status),
            RequestError::RefreshRejected(RefreshRejected {
                reason: RefreshFailure::Rejected { status } | RefreshFailure::UnexpectedStatus { status },
                ..
            }) => Some(*status),
            _ => None,
        }
    }

    /// True when the caller should treat the user as signed out.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            RequestError::RefreshRejected(_)
                | RequestError::Transport(TransportFailure::RefreshRejected { .. })
                | RequestError::Transport(TransportFailure::AuthExpired { .. })
                | RequestError::InvalidCredentials(_)
                | RequestError::NoSession
        )
    }
}

/// Failure persisting or reading the session record.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for RequestError {
    fn from(err: StorageError) -> Self {
        RequestError::Storage(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
