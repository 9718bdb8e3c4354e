//! Request helpers for the remote server's control API.
//!
//! Every call carries an explicit timeout. Transport failures become
//! [`SyncError::Unreachable`]; any HTTP answer, good or bad, becomes an
//! [`ApiResponse`] so callers can tell "no data" apart from "failure".

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;

/// Environment metadata endpoint (`{version, workspaceLocation}`).
pub const ENV_PATH: &str = "api/v1/environment";
/// Project collection endpoint.
pub const PROJECTS_PATH: &str = "api/v1/projects";
/// Push-event WebSocket endpoint.
pub const EVENTS_PATH: &str = "api/v1/events";

/// Outcome of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Response body of a 2xx answer, `None` when empty.
    pub body: Option<String>,
    /// Response body of a non-2xx answer, `None` when empty.
    pub error_body: Option<String>,
}

impl ApiResponse {
    /// True for any 2xx status.
    pub fn is_good(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON. A good response with no body is a protocol
    /// error here because the caller asked for data.
    pub fn json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, SyncError> {
        let body = self
            .body
            .as_deref()
            .ok_or_else(|| SyncError::protocol(url, "empty response body"))?;
        serde_json::from_str(body).map_err(|e| SyncError::protocol(url, e))
    }

    /// Turn a non-2xx answer into an error. 5xx answers are treated as
    /// unreachable since the server is usually still starting up.
    pub fn error_for_status(self, url: &Url) -> Result<Self, SyncError> {
        if self.is_good() {
            return Ok(self);
        }
        let detail = match &self.error_body {
            Some(body) => format!("HTTP {}: {}", self.status, body),
            None => format!("HTTP {}", self.status),
        };
        if self.status >= 500 {
            Err(SyncError::unreachable(url, detail))
        } else {
            Err(SyncError::protocol(url, detail))
        }
    }
}

/// Thin wrapper around a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::unreachable("http client", e))?;
        Ok(Self { http })
    }

    pub async fn get(
        &self,
        url: &Url,
        headers: &[(&str, &str)],
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<ApiResponse, SyncError> {
        let mut req = self.http.get(url.clone()).timeout(timeout);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        send(url, req).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        url: &Url,
        headers: &[(&str, &str)],
        body: &B,
        timeout: Duration,
    ) -> Result<ApiResponse, SyncError> {
        let mut req = self.http.post(url.clone()).timeout(timeout).json(body);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        send(url, req).await
    }
}

async fn send(url: &Url, req: reqwest::RequestBuilder) -> Result<ApiResponse, SyncError> {
    let resp = req.send().await.map_err(|e| {
        tracing::debug!(url = %url, error = %e, "request failed");
        SyncError::unreachable(url, e)
    })?;

    let status = resp.status().as_u16();
    // Some failures only populate the body, so read it either way.
    let text = match resp.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(url = %url, status, error = %e, "failed to read response body");
            String::new()
        }
    };
    let text = (!text.trim().is_empty()).then_some(text);

    let response = if (200..300).contains(&status) {
        ApiResponse {
            status,
            body: text,
            error_body: None,
        }
    } else {
        ApiResponse {
            status,
            body: None,
            error_body: text,
        }
    };
    tracing::trace!(url = %url, status, "request complete");
    Ok(response)
}
