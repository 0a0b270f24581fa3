//! Request transport: immutable request descriptors, responses, and the
//! failure classification every other layer relies on.

pub mod http;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

use crate::error::{RequestError, TransportFailure};

pub use http::HttpTransport;

/// Distinguishes a first attempt from its single permitted replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMarker {
    Original,
    Replayed,
}

/// Everything needed to (re)issue one request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retry_marker: RetryMarker,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retry_marker: RetryMarker::Original,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RequestError::InvalidRequest(format!("header value for {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_json<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self, RequestError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| RequestError::InvalidRequest(format!("serialize json body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn retry_marker(&self) -> RetryMarker {
        self.retry_marker
    }

    pub fn is_replay(&self) -> bool {
        self.retry_marker == RetryMarker::Replayed
    }

    /// Copy of this descriptor marked as its one replay.
    pub fn as_replay(&self) -> Self {
        Self {
            retry_marker: RetryMarker::Replayed,
            ..self.clone()
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_slice(&self.body).map_err(|e| RequestError::Decode(e.to_string()))
    }
}

/// Maps a status and the request's own path to a failure class.
///
/// The refresh path is checked before the status: a 401 from the refresh
/// endpoint means the refresh credential is gone, and treating it as an
/// expired access credential would start another refresh.
#[derive(Debug, Clone)]
pub struct Classifier {
    refresh_path: String,
}

impl Classifier {
    pub fn new(refresh_path: impl Into<String>) -> Self {
        Self {
            refresh_path: endpoint_path(&refresh_path.into()),
        }
    }

    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    pub fn is_refresh_path(&self, path: &str) -> bool {
        endpoint_path(path) == self.refresh_path
    }

    /// `None` for success, otherwise the failure class.
    pub fn classify(&self, path: &str, status: StatusCode, body: &[u8]) -> Option<TransportFailure> {
        if status.is_success() {
            return None;
        }

        let on_refresh = self.is_refresh_path(path);
        let failure = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if on_refresh => {
                TransportFailure::RefreshRejected {
                    status: status.as_u16(),
                }
            }
            StatusCode::UNAUTHORIZED => TransportFailure::AuthExpired {
                path: path.to_string(),
            },
            _ => TransportFailure::Http {
                status: status.as_u16(),
                path: path.to_string(),
                body: String::from_utf8_lossy(body).into_owned(),
            },
        };
        Some(failure)
    }
}

/// `path` rooted at the base URL: exactly one leading slash, query kept.
/// This is the path a request is actually sent to.
pub(crate) fn rooted_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

// The endpoint a rooted path addresses: no query, fragment or trailing slash.
fn endpoint_path(path: &str) -> String {
    let rooted = rooted_path(path);
    let without_query = rooted.split(['?', '#']).next().unwrap_or("/");
    match without_query.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Issues requests against the backend with the session cookies attached.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &RequestDescriptor,
    ) -> impl Future<Output = Result<Response, TransportFailure>> + Send;
}
