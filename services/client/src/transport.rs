//! HTTP Transport
//!
//! The gateway talks to the backend through the `Transport` trait so the
//! session logic can be exercised without a network. `ReqwestTransport` is
//! the production implementation.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, Method, header::HeaderMap};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// A failed request: either the server answered with a non-2xx status, or
/// no answer was received at all (`status` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub status: Option<u16>,
    /// Server-supplied explanation, when the error body carried one.
    pub detail: Option<String>,
}

impl TransportFailure {
    pub fn status(status: u16, detail: Option<String>) -> Self {
        Self {
            status: Some(status),
            detail,
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self {
            status: None,
            detail: Some(detail.into()),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one request against the backend and returns the decoded
    /// JSON body (`Value::Null` for an empty body).
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: HeaderMap,
    ) -> Result<Value, TransportFailure>;
}

/// `Transport` over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Creates a transport for the backend at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Backend root, e.g. `https://api.example.com/api`.
    /// * `timeout` - Upper bound for a single request.
    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: HeaderMap,
    ) -> Result<Value, TransportFailure> {
        let url = self.url(path);
        debug!(%method, %url, "Sending request");

        let mut request = self.client.request(method.clone(), &url).headers(headers);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(%method, %url, error = %e, "Request did not complete");
            TransportFailure::network(e.to_string())
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportFailure::network(e.to_string()))?;

        if !status.is_success() {
            warn!(%method, %url, status = status.as_u16(), "Request failed");
            return Err(TransportFailure::status(
                status.as_u16(),
                error_detail(&text),
            ));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Some endpoints answer with plain text; hand it on as a JSON string.
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Extracts the `detail` field of an error body, if there is one.
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::String(detail) => Some(detail.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
