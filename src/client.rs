//! Interceptor pipeline: the client application code talks to.
//!
//! Every request is sent once. An expired access credential parks the
//! request on the shared refresh cycle and replays it once the cycle
//! settles; a rejected refresh credential clears the session; everything
//! else is returned to the caller untouched.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{RequestError, TransportFailure};
use crate::refresh::{PendingReplay, RefreshCoordinator};
use crate::session::{FileStorage, MemoryStorage, Session, SessionStorage, SessionStore};
use crate::transport::{HttpTransport, RequestDescriptor, Response, Transport};

#[derive(Debug, Clone)]
struct Endpoints {
    login: String,
    logout: String,
    profile: String,
}

/// Authenticated client. Cheap to clone; clones share the session and the
/// refresh coordinator.
pub struct AuthClient<T: Transport = HttpTransport> {
    transport: Arc<T>,
    coordinator: RefreshCoordinator<T>,
    session: SessionStore,
    endpoints: Endpoints,
}

impl<T: Transport> Clone for AuthClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            coordinator: self.coordinator.clone(),
            session: self.session.clone(),
            endpoints: self.endpoints.clone(),
        }
    }
}

impl AuthClient<HttpTransport> {
    /// Build the HTTP client, restoring any persisted session.
    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let storage: Arc<dyn SessionStorage> = match &config.storage_dir {
            Some(dir) => Arc::new(FileStorage::new(dir)),
            None => Arc::new(MemoryStorage::new()),
        };
        let session = SessionStore::load(storage, &config.storage_key);
        let transport = HttpTransport::new(config).context("creating transport")?;
        Ok(Self::new(Arc::new(transport), session, config))
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProfileUpdate {
    #[serde(default)]
    favourite_genres: Option<Vec<Value>>,
    #[serde(default)]
    email_verified: Option<bool>,
}

impl<T: Transport> AuthClient<T> {
    pub fn new(transport: Arc<T>, session: SessionStore, config: &ClientConfig) -> Self {
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&transport),
            session.clone(),
            config.refresh_path.as_str(),
            config.refresh_timeout(),
        );
        Self {
            transport,
            coordinator,
            session,
            endpoints: Endpoints {
                login: config.login_path.clone(),
                logout: config.logout_path.clone(),
                profile: config.profile_path.clone(),
            },
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator<T> {
        &self.coordinator
    }

    /// Send a request through the pipeline.
    pub async fn send(&self, request: RequestDescriptor) -> Result<Response, RequestError> {
        match self.transport.send(&request).await {
            Ok(response) => Ok(response),
            Err(TransportFailure::AuthExpired { path }) if !request.is_replay() => {
                debug!(path = %path, method = %request.method(), "access credential expired; parking request");
                self.park(request).wait().await
            }
            Err(TransportFailure::AuthExpired { path }) => {
                warn!(path = %path, "replayed request unauthorized; not retrying");
                Err(TransportFailure::AuthExpired { path }.into())
            }
            Err(TransportFailure::RefreshRejected { status }) => {
                warn!(status, path = %request.path(), "refresh credential rejected; clearing session");
                if let Err(err) = self.session.clear("refresh credential rejected").await {
                    error!(error = %err, "failed to clear persisted session");
                }
                Err(TransportFailure::RefreshRejected { status }.into())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Park a request on the refresh cycle directly. The returned handle can
    /// be cancelled without affecting other parked requests.
    pub fn park(&self, request: RequestDescriptor) -> PendingReplay<T> {
        self.coordinator.park(request)
    }

    pub async fn get(&self, path: &str) -> Result<Response, RequestError> {
        self.send(RequestDescriptor::get(path)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, RequestError> {
        self.send(RequestDescriptor::post(path).with_json(body)?).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, RequestError> {
        self.send(RequestDescriptor::put(path).with_json(body)?).await
    }

    pub async fn patch_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, RequestError> {
        self.send(RequestDescriptor::patch(path).with_json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response, RequestError> {
        self.send(RequestDescriptor::delete(path)).await
    }

    /// Sign in. The backend sets the credential cookies; the returned user
    /// record becomes the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, RequestError> {
        let request =
            RequestDescriptor::post(self.endpoints.login.as_str()).with_json(&LoginRequest { email, password })?;

        // not intercepted: a 401 here means bad credentials, not a stale cookie
        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(TransportFailure::AuthExpired { .. }) => {
                return Err(RequestError::InvalidCredentials(
                    "invalid email or password".to_string(),
                ))
            }
            Err(TransportFailure::Http { status: 400, body, .. }) => {
                return Err(RequestError::InvalidCredentials(error_message(&body)))
            }
            Err(other) => return Err(other.into()),
        };

        let body: Value = response.json()?;
        if let Some(message) = body.get("error").and_then(Value::as_str) {
            return Err(RequestError::InvalidCredentials(message.to_string()));
        }
        let session: Session =
            serde_json::from_value(body).map_err(|e| RequestError::Decode(e.to_string()))?;

        self.session.set(Some(session.clone())).await?;
        info!(user_id = %session.user_id(), role = session.role.as_str(), "signed in");
        Ok(session)
    }

    /// Sign out. The local session is cleared even when the server call
    /// fails; that failure is still returned.
    pub async fn logout(&self) -> Result<(), RequestError> {
        let current = self.session.get().await;

        let server_result = match &current {
            Some(session) => {
                let request = RequestDescriptor::post(self.endpoints.logout.as_str())
                    .with_json(&json!({ "user_id": session.user_id() }))?;
                self.transport.send(&request).await.map(|_| ())
            }
            None => Ok(()),
        };

        self.session.clear("logout").await?;
        if let Err(err) = &server_result {
            warn!(error = %err, "logout request failed; local session cleared anyway");
        } else {
            info!("signed out");
        }
        server_result.map_err(RequestError::from)
    }

    /// Fetch the canonical profile and merge it into the session.
    pub async fn sync_profile(&self) -> Result<Session, RequestError> {
        if !self.session.is_authenticated().await {
            return Err(RequestError::NoSession);
        }
        let response = self.get(&self.endpoints.profile).await?;
        let profile: ProfileUpdate = response.json()?;

        let updated = self
            .session
            .update(move |session| {
                if let Some(genres) = profile.favourite_genres {
                    session.identity.favourite_genres = genres;
                }
                if profile.email_verified.is_some() {
                    session.identity.email_verified = profile.email_verified;
                }
            })
            .await?;

        // signed out while the fetch was in flight
        updated.ok_or(RequestError::NoSession)
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "invalid email or password".to_string())
}
