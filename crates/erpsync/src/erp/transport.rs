//! Transport seam over the ERP's HTTP endpoints
//!
//! Everything above this layer works with [`ErpRequest`]/[`ErpResponse`]
//! values, so retry logic and the sync engine can be tested against scripted
//! transports without a network.

use serde_json::json;
use std::time::Duration;

use super::api::FilePageRequest;
use crate::config::ErpCredentials;

/// A single request to the ERP, before any retry handling
#[derive(Debug, Clone)]
pub enum ErpRequest {
    /// SQL-like bulk query returning JSON rows
    Query { statement: String },
    /// One page of a pre-staged export file
    FilePage(FilePageRequest),
}

/// Raw response from the ERP: status, optional retry hint, body text
#[derive(Debug, Clone)]
pub struct ErpResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if the server sent one
    pub retry_after: Option<String>,
    pub body: String,
}

impl ErpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure (connection refused, TLS, timeout)
#[derive(Debug, thiserror::Error)]
#[error("ERP transport error: {0}")]
pub struct TransportError(pub String);

/// Executes one ERP request and returns the raw response.
///
/// Implementations must not retry; throttle handling belongs to the client
/// layer so it happens exactly once, in one place.
pub trait ErpTransport: Send + Sync {
    fn execute(&self, req: &ErpRequest) -> Result<ErpResponse, TransportError>;
}

/// Production transport backed by ureq (synchronous, executor-agnostic)
pub struct UreqTransport {
    agent: ureq::Agent,
    query_url: String,
    file_url: String,
    token: String,
}

impl UreqTransport {
    pub fn new(credentials: &ErpCredentials) -> Self {
        // Non-2xx responses must come back as responses (we need the body
        // and Retry-After header for throttle handling), not as errors.
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(120)))
            .build();

        let base = credentials.base_url.trim_end_matches('/');
        Self {
            agent: config.into(),
            query_url: format!("{}/services/query/v1", base),
            file_url: format!("{}/services/file/v1", base),
            token: credentials.token.clone(),
        }
    }
}

impl ErpTransport for UreqTransport {
    fn execute(&self, req: &ErpRequest) -> Result<ErpResponse, TransportError> {
        let (url, payload) = match req {
            ErpRequest::Query { statement } => (&self.query_url, json!({ "q": statement })),
            ErpRequest::FilePage(page) => (
                &self.file_url,
                serde_json::to_value(page).map_err(|e| TransportError(e.to_string()))?,
            ),
        };

        let mut response = self
            .agent
            .post(url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .send_json(&payload)
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(ErpResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_range() {
        let mut resp = ErpResponse {
            status: 200,
            retry_after: None,
            body: String::new(),
        };
        assert!(resp.is_success());
        resp.status = 204;
        assert!(resp.is_success());
        resp.status = 299;
        assert!(resp.is_success());
        resp.status = 300;
        assert!(!resp.is_success());
        resp.status = 429;
        assert!(!resp.is_success());
    }
}
