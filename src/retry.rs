use crate::config::RetryConfig;
use crate::error::{FetchError, FetchErrorKind};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded retry with a deterministic exponential curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound for server-provided `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        // no jitter: the curve must be monotonic and reproducible
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Waits between consecutive attempts, ignoring server hints.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts)
            .map(|_| backoff.next_backoff().unwrap_or(self.max_backoff))
            .collect()
    }

    pub fn is_retryable(err: &FetchError) -> bool {
        match err.kind {
            FetchErrorKind::Network | FetchErrorKind::Timeout => true,
            FetchErrorKind::HttpStatus(code) => code == 408 || code == 429 || (500..600).contains(&code),
            FetchErrorKind::Cancelled => false,
        }
    }

    fn wait_for(&self, err: &FetchError, backoff: &mut ExponentialBackoff) -> Duration {
        let wait = backoff.next_backoff().unwrap_or(self.max_backoff);
        match (err.kind, err.retry_after) {
            (FetchErrorKind::HttpStatus(429 | 503), Some(hint)) => wait.max(hint.min(self.max_retry_after)),
            _ => wait,
        }
    }

    /// Run `op` until it succeeds, fails terminally or exhausts `max_attempts`.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_cancelled() || !Self::is_retryable(&err) || attempt >= self.max_attempts {
                return Err(err);
            }

            let wait = self.wait_for(&err, &mut backoff);
            warn!(
                "[RETRY] {} attempt {}/{} failed ({}), retrying in {:?}",
                what, attempt, self.max_attempts, err.kind, wait
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::cancelled(err.url)),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }
}
