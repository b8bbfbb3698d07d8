//! Client configuration options.

use std::time::Duration;

/// Configuration for the Bitrix24 client.
///
/// # Example
///
/// ```
/// use bitrix24_rs::{ClientConfig, RetryConfig};
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_timeout(Duration::from_secs(60))
///     .with_user_agent("my-app/1.0")
///     .with_retry(RetryConfig::default().with_max_retries(2));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout of one physical HTTP call
    pub timeout: Duration,
    /// User-Agent header value
    pub user_agent: String,
    /// Retry policy for transient transport failures
    pub retry: RetryConfig,
    /// Renew an OAuth token this long before it expires, `None` to renew
    /// only when the portal reports it as expired
    pub refresh_ahead: Option<chrono::Duration>,
    /// Number of batch chunks dispatched at once
    pub max_concurrent_chunks: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("bitrix24-rs/{} (Rust)", env!("CARGO_PKG_VERSION")),
            retry: RetryConfig::default(),
            refresh_ahead: None,
            max_concurrent_chunks: 1,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Renew OAuth tokens `secs` seconds before they expire.
    pub fn with_refresh_ahead(mut self, secs: i64) -> crate::Result<Self> {
        let window = chrono::Duration::try_seconds(secs).ok_or_else(|| {
            crate::Error::Config(format!("Refresh-ahead window out of range: {}s", secs))
        })?;
        self.refresh_ahead = Some(window);
        Ok(self)
    }

    /// Dispatch up to `chunks` batch chunks concurrently.
    ///
    /// Only applies to batches without halt-on-error. Whether the portal's
    /// rate limiting tolerates concurrent chunks from one credential is not
    /// documented; keep the default of 1 unless verified.
    pub fn with_max_concurrent_chunks(mut self, chunks: usize) -> Self {
        self.max_concurrent_chunks = chunks.max(1);
        self
    }
}

/// Configuration for automatic retries of transient failures.
///
/// Renewal of an expired token is not a retry and is not governed by this
/// policy. By default nothing is retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// HTTP status codes to retry on
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Create a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Set the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Calculate the backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_millis =
            (self.initial_backoff.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
        let max_millis = self.max_backoff.as_millis() as u64;
        Duration::from_millis(backoff_millis.min(max_millis))
    }

    /// Check if a status code should be retried.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Check if an error is a transient failure this policy retries.
    pub(crate) fn should_retry(&self, err: &crate::Error) -> bool {
        match err {
            crate::Error::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            crate::Error::RemoteApi {
                status: Some(status),
                ..
            } => self.should_retry_status(*status),
            _ => false,
        }
    }
}
