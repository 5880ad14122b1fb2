//! Retry policy and the exponential-backoff retry loop

use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for failed attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff growth factor per retry
    pub multiplier: f64,
    /// HTTP status codes that trigger a retry
    pub retryable_status_codes: Vec<u16>,
    /// Case-insensitive substrings of transport errors that trigger a retry
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            retryable_status_codes: vec![500, 502, 503, 504],
            retryable_errors: vec![
                "timeout".to_string(),
                "connection refused".to_string(),
                "connection reset".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.multiplier = multiplier;
        self
    }

    /// Check if a status code should trigger a retry
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn is_retryable(&self, error: &TransportError) -> bool {
        if let TransportError::Status { status } = error {
            return self.should_retry_status(*status);
        }

        let message = error.to_string().to_lowercase();
        self.retryable_errors
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }

    /// Delay before retry number `attempt + 1`: `initial * multiplier^attempt`, capped
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_backoff.as_nanos() as f64);
        if capped.is_nan() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(capped as u64)
    }
}

/// Why the retry loop gave up
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of retries. `operation` receives the zero-based attempt number.
///
/// Cancellation is observed both while an attempt is in flight and during the
/// backoff sleep; either returns `RetryError::Cancelled` without further attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt + 1 });
            }
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let attempts = attempt + 1;
        if attempt >= policy.max_retries || !policy.is_retryable(&error) {
            debug!(attempts, "Giving up: {}", error);
            return Err(RetryError::Failed {
                attempts,
                source: error,
            });
        }

        let delay = policy.backoff_duration(attempt);
        warn!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying: {}",
            error
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
