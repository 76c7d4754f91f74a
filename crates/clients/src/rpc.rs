use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use keel_primitives::retries::is_connection_refused;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Errors that can occur when issuing a JSON-RPC request over HTTP.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum JsonRpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Response has neither a result nor an error")]
    EmptyResponse,
    #[error("Operation failed after retries. Last error: {last_error}")]
    RetriesExhausted { last_error: Box<JsonRpcError> },
}

impl JsonRpcError {
    /// Returns whether this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                // Check common error cases that might be resolved by retry
                is_connection_refused(e) ||
                    e.is_timeout() ||
                    e.is_connect() ||
                    e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

/// Retry configuration of a JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retry attempts.
    pub retry_attempts: usize,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { retry_attempts: 3, base_delay: Duration::from_millis(100) }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

/// A minimal JSON-RPC over HTTP client.
#[derive(Debug)]
pub struct JsonRpcClient {
    inner: Client,
    url: Url,
    next_id: AtomicU64,
    /// The retry configuration used by [`JsonRpcClient::call_with_retries`].
    pub config: RetryConfig,
}

impl JsonRpcClient {
    /// Create a new client for the given endpoint, with the given request timeout.
    pub fn new(url: Url, timeout: Duration) -> Self {
        let inner = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { inner, url, next_id: AtomicU64::new(1), config: RetryConfig::default() }
    }

    /// The endpoint of this client.
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Issue a single JSON-RPC call.
    pub async fn call<P, T>(&self, method: &str, params: P) -> Result<T, JsonRpcError>
    where
        P: Serialize + Send + Sync,
        T: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { jsonrpc: "2.0", id, method, params };

        let response = self
            .inner
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<Response>()
            .await?;

        if let Some(err) = response.error {
            return Err(JsonRpcError::Rpc { code: err.code, message: err.message });
        }

        match response.result {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(JsonRpcError::EmptyResponse),
        }
    }

    /// Issue a JSON-RPC call, retrying transient failures with exponential backoff.
    pub async fn call_with_retries<P, T>(&self, method: &str, params: P) -> Result<T, JsonRpcError>
    where
        P: Serialize + Send + Sync,
        T: DeserializeOwned,
    {
        let mut delay = self.config.base_delay;
        let mut last_err = None;

        for attempt in 0..=self.config.retry_attempts {
            if attempt > 0 {
                debug!(method, "Retry attempt {}: sleeping for {:?}", attempt, delay);
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(10));
            }

            match self.call(method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(method, "Attempt {} failed: {}.", attempt, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(last_error) => Err(JsonRpcError::RetriesExhausted { last_error: Box::new(last_error) }),
            None => Err(JsonRpcError::EmptyResponse),
        }
    }
}
