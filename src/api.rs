//! Order service HTTP plumbing.
//!
//! Authenticated JSON requests against the order service, with URL
//! normalisation and mapping of transport and status failures into
//! user-facing [`Error`] values. No retries happen here; retry policy belongs
//! to the caller.

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!(
    "order-sync-core/",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_SHA"),
    ")"
);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the order service base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment (paths below already carry it)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    if err.is_connect() {
        return Error::Network(format!("Cannot reach order service at {url}"));
    }
    if err.is_timeout() {
        return Error::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return Error::Network(format!("Invalid order service URL: {url}"));
    }
    Error::Network(format!("Network error communicating with {url}: {err}"))
}

/// Fallback text for an HTTP status without a usable body.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired, please sign in again".to_string(),
        403 => "Not allowed to perform this action".to_string(),
        404 => "Order service endpoint not found".to_string(),
        s if s >= 500 => format!("Order service error (HTTP {s})"),
        s => format!("Unexpected response from order service (HTTP {s})"),
    }
}

/// Build the typed failure for a non-success response, preferring the
/// service's own `message`/`error` text.
fn status_error(status: StatusCode, body_text: &str) -> Error {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| crate::value_str(&json, &["message", "error"]))
        .unwrap_or_else(|| status_message(status));
    Error::service(status.as_u16(), message)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    connectivity_timeout: std::time::Duration,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.base_url);
        if base_url.is_empty() {
            return Err(Error::Config("Order service base URL is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            auth_token: config
                .auth_token
                .as_ref()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            connectivity_timeout: config.connectivity_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated JSON request.
    ///
    /// `path` includes the leading slash, e.g. `/api/orders`. Returns the
    /// parsed JSON body, or `Value::Null` for an empty 2xx response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %full_url, "Sending order service request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = status_error(status, &body_text);
            warn!(url = %full_url, status = status.as_u16(), error = %err, "Order service request failed");
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| Error::Decode(format!("Invalid JSON from order service: {e}")))
    }

    /// Lightweight reachability probe against the service health endpoint.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();

        let resp = match self
            .client
            .get(&health_url)
            .timeout(self.connectivity_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base_url, &e).user_message()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_message(status)),
            }
        }
    }
}
