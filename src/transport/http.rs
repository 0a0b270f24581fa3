use anyhow::{Context, Result};
use reqwest::header::HeaderValue;
use reqwest::Client;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::TransportFailure;
use crate::transport::{rooted_path, Classifier, RequestDescriptor, Response, Transport};

const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// reqwest-backed transport.
///
/// The client keeps a cookie jar, so the HTTP-only access and refresh cookies
/// set by the backend ride along on every request without the caller ever
/// seeing them.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
    classifier: Classifier,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout())
            .build()
            .context("building http client")?;

        Ok(Self::with_client(
            &config.base_url,
            client,
            Classifier::new(&config.refresh_path),
        ))
    }

    /// Use a caller-built client. It must have a cookie store enabled for
    /// credentials to be carried between requests.
    pub fn with_client(base_url: &str, client: Client, classifier: Classifier) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            classifier,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    // Same rooting the classifier applies, so both agree on the endpoint.
    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, rooted_path(path))
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure> {
        let url = self.url_for(request.path());
        let request_id = Uuid::new_v4().to_string();

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .headers(request.headers().clone());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            builder = builder.header(REQUEST_ID_HEADER, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        trace!(
            url = %url,
            method = %request.method(),
            request_id = %request_id,
            replay = request.is_replay(),
            "sending request"
        );

        let resp = builder.send().await.map_err(|e| {
            debug!(url = %url, request_id = %request_id, error = %e, "request did not reach the server");
            TransportFailure::Network(e.to_string())
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportFailure::Network(format!("reading response body: {e}")))?
            .to_vec();

        debug!(
            status_code = %status.as_u16(),
            url = %url,
            request_id = %request_id,
            "received response"
        );

        match self.classifier.classify(request.path(), status, &body) {
            None => Ok(Response::new(status, headers, body)),
            Some(failure) => Err(failure),
        }
    }
}
