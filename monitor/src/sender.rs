//! Flow service client for FlowPulse Monitor.
//!
//! The pipeline and the flow engine talk to the backend through the
//! [`FlowService`] trait. [`HttpFlowClient`] is the production implementation:
//!
//! - Connection pooling via reqwest
//! - Exponential backoff retry (1s → 60s max, ±25% jitter)
//! - Rate limit handling (429 with Retry-After header)
//! - A bounded number of attempts per request
//!
//! # Example
//!
//! ```no_run
//! use flowpulse_monitor::sender::{FlowService, HttpFlowClient, SenderConfig};
//! use flowpulse_monitor::types::FlowBatch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SenderConfig::new(
//!         "https://flow.example.com".to_string(),
//!         "workstation-1".to_string(),
//!     );
//!     let client = HttpFlowClient::new(config).unwrap();
//!
//!     let batch = FlowBatch::new("intellij", "batch_20230417085500_ab12_0.flow");
//!     client.publish_batch(&batch).await.unwrap();
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::types::FlowBatch;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Maximum number of attempts per request.
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Path of the batch ingest endpoint.
const BATCH_PATH: &str = "/flow/batch";

/// Path of the flow state endpoint.
const STATE_PATH: &str = "/flow/state";

/// Errors that can occur while talking to the flow service.
#[derive(Error, Debug)]
pub enum SenderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Rate limited (429) on the final attempt.
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Maximum retry attempts exceeded.
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid header value (source_id contains invalid characters).
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// The backend operations the monitor depends on.
///
/// Both operations must be safe to repeat: a batch may be delivered more than
/// once and the receiver deduplicates on [`FlowBatch::batch_id`].
pub trait FlowService: Send + Sync {
    /// Submits one batch. `Ok` means the server acknowledged it.
    fn publish_batch(&self, batch: &FlowBatch)
        -> impl Future<Output = Result<(), SenderError>> + Send;

    /// Fetches the server's latest flow state table.
    fn fetch_flow_state(&self) -> impl Future<Output = Result<FlowStateTable, SenderError>> + Send;
}

/// Tabular flow state as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStateTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl FlowStateTable {
    /// Flattens the table into a key/value map.
    ///
    /// Two layouts are understood: a `key`/`value` table with one row per
    /// entry, and a wide table whose first row holds one value per column.
    #[must_use]
    pub fn to_key_value_map(&self) -> HashMap<String, String> {
        let is_pairs = self.columns.len() == 2
            && self.columns[0].eq_ignore_ascii_case("key")
            && self.columns[1].eq_ignore_ascii_case("value");

        if is_pairs {
            return self
                .rows
                .iter()
                .filter_map(|row| match row.as_slice() {
                    [key, value, ..] => Some((value_to_string(key), value_to_string(value))),
                    _ => None,
                })
                .collect();
        }

        let Some(row) = self.rows.first() else {
            return HashMap::new();
        };
        self.columns
            .iter()
            .zip(row)
            .map(|(column, value)| (column.clone(), value_to_string(value)))
            .collect()
    }
}

/// Strings are taken verbatim; everything else uses its JSON form.
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Backoff schedule for a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fractional jitter applied to each delay, e.g. `0.25` for ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            max_attempts: MAX_RETRY_ATTEMPTS,
            jitter: JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays with no jitter, for tests against a mock server.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 3,
            jitter: 0.0,
        }
    }
}

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Server URL (e.g., `https://flow.example.com`).
    pub server_url: String,

    /// Source ID sent with every request.
    pub source_id: String,

    pub retry: RetryPolicy,
}

impl SenderConfig {
    /// Creates a configuration with the default retry policy.
    #[must_use]
    pub fn new(server_url: String, source_id: String) -> Self {
        Self {
            server_url,
            source_id,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Tracks the delay for the next retry of one request.
#[derive(Debug)]
struct Backoff<'a> {
    policy: &'a RetryPolicy,
    current: Duration,
}

impl<'a> Backoff<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_delay,
        }
    }

    /// Waits for the current delay with jitter, then doubles it.
    async fn wait(&mut self) {
        let delay = add_jitter(self.current, self.policy.jitter);
        debug!(delay_ms = delay.as_millis(), "Waiting before retry");
        sleep(delay).await;
        self.current = (self.current * 2).min(self.policy.max_delay);
    }
}

/// Adds ±`factor` jitter to a duration.
fn add_jitter(duration: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return duration;
    }
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * factor;
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
}

/// HTTP implementation of [`FlowService`].
#[derive(Debug, Clone)]
pub struct HttpFlowClient {
    config: SenderConfig,
    client: Client,
}

impl HttpFlowClient {
    /// Creates a client with connection pooling and a 30 second timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Http`] if the underlying client cannot be built.
    pub fn new(config: SenderConfig) -> Result<Self, SenderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { config, client })
    }

    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap, SenderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Source-Id", HeaderValue::from_str(&self.config.source_id)?);
        Ok(headers)
    }

    /// Sends a request built by `build`, retrying transient failures.
    async fn execute<F>(&self, what: &'static str, build: F) -> Result<Response, SenderError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let policy = &self.config.retry;
        let mut backoff = Backoff::new(policy);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(request = what, attempt = attempts, "Sending request");

            match build().send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = parse_retry_after(&response, backoff.current);
                        warn!(
                            request = what,
                            retry_after_secs = retry_after,
                            "Rate limited by server"
                        );

                        if attempts >= policy.max_attempts {
                            return Err(SenderError::RateLimited {
                                retry_after_secs: retry_after,
                            });
                        }

                        sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }

                    let message = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        warn!(
                            request = what,
                            status = status.as_u16(),
                            message = %message,
                            "Server error, will retry"
                        );

                        if attempts >= policy.max_attempts {
                            return Err(SenderError::ServerError {
                                status: status.as_u16(),
                                message,
                            });
                        }

                        backoff.wait().await;
                        continue;
                    }

                    return Err(SenderError::ServerError {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(e) => {
                    if e.is_timeout() || e.is_connect() {
                        warn!(request = what, error = %e, "Connection error, will retry");

                        if attempts >= policy.max_attempts {
                            return Err(SenderError::MaxRetriesExceeded { attempts });
                        }

                        backoff.wait().await;
                        continue;
                    }

                    return Err(SenderError::Http(e));
                }
            }
        }
    }
}

/// Parses the Retry-After header from a 429 response, in seconds.
fn parse_retry_after(response: &Response, fallback: Duration) -> u64 {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(fallback.as_secs())
}

impl FlowService for HttpFlowClient {
    async fn publish_batch(&self, batch: &FlowBatch) -> Result<(), SenderError> {
        let url = self.url(BATCH_PATH);
        let body = serde_json::to_string(batch)?;
        let headers = self.headers()?;

        self.execute("publish_batch", || {
            self.client
                .post(&url)
                .headers(headers.clone())
                .body(body.clone())
        })
        .await?;

        info!(batch_id = %batch.batch_id, records = batch.len(), "Flow batch published");
        Ok(())
    }

    async fn fetch_flow_state(&self) -> Result<FlowStateTable, SenderError> {
        let url = self.url(STATE_PATH);
        let headers = self.headers()?;

        let response = self
            .execute("fetch_flow_state", || {
                self.client.get(&url).headers(headers.clone())
            })
            .await?;

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}
