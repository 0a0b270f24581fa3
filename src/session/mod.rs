//! Auth session store: the single owner of the signed-in identity.
//!
//! The store restores the persisted record once at startup and writes it
//! back on every mutation. A mutation is persisted before it is committed in
//! memory, so readers never see a session that storage does not hold.

pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::security::AuditLogger;

pub use storage::{FileStorage, MemoryStorage, SessionStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }
}

/// Identity fields returned by the backend on login and profile fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub favourite_genres: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

/// The authenticated session as persisted: a flat record with the role alongside the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub identity: UserIdentity,
    pub role: Role,
}

impl Session {
    pub fn new(identity: UserIdentity, role: Role) -> Self {
        Self { identity, role }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug)]
struct StoreState {
    session: Option<Session>,
    last_changed: Option<DateTime<Utc>>,
}

/// Shared handle to the current session. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    state: Arc<RwLock<StoreState>>,
    storage: Arc<dyn SessionStorage>,
    key: Arc<str>,
    audit: AuditLogger,
}

impl SessionStore {
    /// Restore the session persisted under `key`.
    ///
    /// Unreadable or malformed records are logged, removed from storage and
    /// treated as "no session". This never fails the caller.
    pub fn load(storage: Arc<dyn SessionStorage>, key: &str) -> Self {
        let audit = AuditLogger::new();
        let session = match storage.read(key) {
            Ok(Some(raw)) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    audit.session_restored(session.user_id(), session.role.as_str());
                    Some(session)
                }
                Err(err) => {
                    warn!(key, error = %err, "discarding malformed persisted session");
                    audit.session_restore_failed(&err.to_string());
                    if let Err(err) = storage.remove(key) {
                        warn!(key, error = %err, "failed to remove malformed session record");
                    }
                    None
                }
            },
            Ok(None) => {
                debug!(key, "no persisted session");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "failed to read persisted session");
                audit.session_restore_failed(&err.to_string());
                None
            }
        };

        Self {
            state: Arc::new(RwLock::new(StoreState {
                session,
                last_changed: None,
            })),
            storage,
            key: Arc::from(key),
            audit,
        }
    }

    /// Store with no durable backing, starting signed out.
    pub fn in_memory() -> Self {
        Self::load(Arc::new(MemoryStorage::new()), "user")
    }

    /// Current session, if any.
    pub async fn get(&self) -> Option<Session> {
        self.state.read().await.session.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.session.is_some()
    }

    /// Persist and commit a new session value; `None` clears it.
    ///
    /// On a storage error the in-memory session is left unchanged.
    pub async fn set(&self, session: Option<Session>) -> StorageResult<()> {
        let mut state = self.state.write().await;

        match &session {
            Some(next) => {
                let raw = serde_json::to_string(next)?;
                self.persist(Some(raw)).await?;
                self.audit
                    .session_committed(next.user_id(), next.role.as_str());
            }
            None => {
                self.persist(None).await?;
                let previous = state.session.as_ref().map(|s| s.user_id().to_string());
                self.audit.session_cleared(previous.as_deref(), "set");
            }
        }

        state.session = session;
        state.last_changed = Some(Utc::now());
        Ok(())
    }

    /// Clear the session, recording why.
    pub async fn clear(&self, reason: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        self.persist(None).await?;

        let previous = state.session.take();
        state.last_changed = Some(Utc::now());
        self.audit
            .session_cleared(previous.as_ref().map(|s| s.user_id()), reason);
        Ok(())
    }

    /// Apply `f` to the current session and persist the result. Returns the
    /// updated session, or `None` when signed out.
    pub async fn update<F>(&self, f: F) -> StorageResult<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut state = self.state.write().await;
        let Some(mut next) = state.session.clone() else {
            return Ok(None);
        };
        f(&mut next);

        let raw = serde_json::to_string(&next)?;
        self.persist(Some(raw)).await?;
        self.audit
            .session_committed(next.user_id(), next.role.as_str());

        state.session = Some(next.clone());
        state.last_changed = Some(Utc::now());
        Ok(Some(next))
    }

    // Backends do blocking file IO; run it on the blocking pool while the
    // caller keeps holding the write guard.
    async fn persist(&self, raw: Option<String>) -> StorageResult<()> {
        let storage = Arc::clone(&self.storage);
        let key = Arc::clone(&self.key);
        tokio::task::spawn_blocking(move || match raw {
            Some(raw) => storage.write(&key, &raw),
            None => storage.remove(&key).map(|_| ()),
        })
        .await
        .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }

    /// Time of the last committed mutation since this store was loaded.
    pub async fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_changed
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }
}
