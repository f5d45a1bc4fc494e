//! Rate-limit-aware ERP query client
//!
//! The upstream ERP throttles aggressively (HTTP 429/503 plus a vendor
//! concurrency-limit error code in 400 bodies) and overlapping scheduled
//! runs are possible, so every request goes through one backoff loop here.
//! Callers never see a throttle: either the request eventually succeeds, or
//! the cumulative-wait ceiling is exceeded and a terminal error surfaces.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::api::{FilePageRequest, FilePageResponse, QueryResponse};
use super::transport::{ErpRequest, ErpResponse, ErpTransport, TransportError};

/// Vendor error codes that signal throttling rather than a bad request
const THROTTLE_CODES: &[&str] = &["CONCURRENCY_LIMIT_EXCEEDED", "REQUEST_LIMIT_EXCEEDED"];

/// Errors surfaced by the query client
#[derive(Debug, thiserror::Error)]
pub enum ErpError {
    /// Non-throttle HTTP failure; body captured for diagnostics
    #[error("ERP query failed with status {status}: {body}")]
    QueryFailed { status: u16, body: String },

    /// Throttled on every attempt until the cumulative wait ceiling
    #[error("ERP throttled for {waited_ms}ms over {attempts} attempts, giving up")]
    RetryBudgetExhausted { waited_ms: u64, attempts: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 2xx response whose body didn't parse as the expected shape
    #[error("unexpected ERP response: {0}")]
    BadResponse(String),
}

/// Backoff schedule for throttled requests
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay; doubles per attempt
    pub initial_delay: Duration,
    /// Per-attempt delay cap
    pub max_delay: Duration,
    /// Hard ceiling on cumulative wait across all retries of one request
    pub wait_ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            wait_ceiling: Duration::from_secs(120),
        }
    }
}

/// Stateless ERP client, safe to share across concurrent callers
pub struct ErpClient {
    transport: Arc<dyn ErpTransport>,
    backoff: BackoffPolicy,
}

impl ErpClient {
    pub fn new(transport: Arc<dyn ErpTransport>) -> Self {
        Self {
            transport,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(transport: Arc<dyn ErpTransport>, backoff: BackoffPolicy) -> Self {
        Self { transport, backoff }
    }

    /// Run a bulk query and return its rows
    pub fn query(&self, statement: &str) -> Result<Vec<Map<String, Value>>, ErpError> {
        let response = self.execute_with_backoff(&ErpRequest::Query {
            statement: statement.to_string(),
        })?;

        let parsed: QueryResponse =
            serde_json::from_str(&response.body).map_err(|e| ErpError::BadResponse(e.to_string()))?;
        Ok(parsed.items)
    }

    /// Fetch one page of a pre-staged export file
    pub fn file_page(&self, request: FilePageRequest) -> Result<FilePageResponse, ErpError> {
        let response = self.execute_with_backoff(&ErpRequest::FilePage(request))?;

        let parsed: FilePageResponse =
            serde_json::from_str(&response.body).map_err(|e| ErpError::BadResponse(e.to_string()))?;
        if !parsed.ok {
            return Err(ErpError::BadResponse(
                parsed.error.unwrap_or_else(|| "file page reported ok=false".to_string()),
            ));
        }
        Ok(parsed)
    }

    /// Execute a request, absorbing throttles with backoff until success, a
    /// non-throttle failure, or the cumulative wait ceiling.
    fn execute_with_backoff(&self, request: &ErpRequest) -> Result<ErpResponse, ErpError> {
        let mut waited = Duration::ZERO;
        let mut delay = self.backoff.initial_delay;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let response = self.transport.execute(request)?;

            if response.is_success() {
                return Ok(response);
            }

            if !is_throttle(&response) {
                return Err(ErpError::QueryFailed {
                    status: response.status,
                    body: response.body,
                });
            }

            // Server hint wins over our schedule when present
            let wait = match response.retry_after.as_deref().and_then(parse_retry_after) {
                Some(hint) => hint,
                None => delay,
            } + Duration::from_millis(rand_jitter());

            if waited + wait > self.backoff.wait_ceiling {
                return Err(ErpError::RetryBudgetExhausted {
                    waited_ms: waited.as_millis() as u64,
                    attempts,
                });
            }

            log::debug!(
                "[ERP] throttled (status {}), attempt {}, backing off {:?}",
                response.status,
                attempts,
                wait
            );
            std::thread::sleep(wait);
            waited += wait;
            delay = (delay * 2).min(self.backoff.max_delay);
        }
    }
}

/// Throttle signal: 429/503, or a vendor concurrency code in the body
fn is_throttle(response: &ErpResponse) -> bool {
    if response.status == 429 || response.status == 503 {
        return true;
    }
    THROTTLE_CODES.iter().any(|code| response.body.contains(code))
}

/// Parse a Retry-After hint: integer seconds or an HTTP-date
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
