//! Bounded exponential backoff around a single provider call.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::providers::ProviderError;

/// Granularity at which a backoff sleep re-checks for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 1.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Reported before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryStatus {
    /// Attempt about to be made (2-based: the first retry is attempt 2).
    pub next_attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub reason: String,
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Retrying in {}s (attempt {}/{})…",
            self.delay.as_secs(),
            self.next_attempt,
            self.max_attempts
        )
    }
}

#[derive(Debug)]
pub enum RetryError {
    /// The caller's cancellation check fired between attempts.
    Cancelled,
    Failed(ProviderError),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.base_delay_secs),
            config.multiplier,
            Duration::from_secs(config.max_delay_secs),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based), clamped to `[base, max]`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = 2f64.powi(retry.min(30) as i32);
        let secs = (self.multiplier * exp).max(0.0);
        Duration::from_secs_f64(secs).clamp(self.base_delay, self.max_delay)
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// the attempt ceiling is reached.
    ///
    /// `is_cancelled` is consulted before every attempt and during backoff.
    /// `on_retry` fires once per scheduled retry.
    ///
    /// # Errors
    /// Returns [`RetryError::Failed`] with the last error, or
    /// [`RetryError::Cancelled`] if cancellation was observed.
    pub async fn run<T, F, Fut, C, S>(
        &self,
        mut call: F,
        is_cancelled: C,
        mut on_retry: S,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        C: Fn() -> bool,
        S: FnMut(&RetryStatus),
    {
        let mut attempt = 1;
        loop {
            if is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(RetryError::Failed(error));
            }

            let delay = self.delay_for(attempt);
            warn!(attempt, wait = ?delay, kind = %error.kind, "provider call failed, retrying: {error}");
            attempt += 1;
            on_retry(&RetryStatus {
                next_attempt: attempt,
                max_attempts: self.max_attempts,
                delay,
                reason: error.message,
            });

            if !sleep_unless_cancelled(delay, &is_cancelled).await {
                return Err(RetryError::Cancelled);
            }
        }
    }
}

/// Returns false if cancellation was observed before `delay` elapsed.
async fn sleep_unless_cancelled<C: Fn() -> bool>(delay: Duration, is_cancelled: &C) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if is_cancelled() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL)).await;
    }
}
