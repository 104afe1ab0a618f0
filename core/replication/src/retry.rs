//! Exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wcpos_common::{Error, Result};

/// Backoff policy: the delay doubles after every failure, up to a cap.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
    /// Spread each delay by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a policy with `max_retries` retries, a 1s first delay and a 60s cap.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Set the delay after the first failure.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after `failures + 1` consecutive failures:
    /// `initial_delay * 2^failures`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Runs a backend call, retrying transient failures.
///
/// Non-transient errors return immediately. Cancellation stops the next
/// attempt and cuts any pending backoff short.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy this executor applies.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Call `operation` until it succeeds, fails permanently or runs out of
    /// retries.
    ///
    /// # Errors
    /// - `Error::Cancelled` if `cancel` fired before an attempt or during a
    ///   backoff
    /// - The first non-transient error
    /// - The last transient error once retries are exhausted
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("request skipped".to_string()));
            }

            let err = match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!("Backend call recovered after {} failures", failures);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if failures >= self.config.max_retries {
                if failures > 0 {
                    warn!("Giving up after {} attempts: {}", failures + 1, err);
                }
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(failures);
            failures += 1;
            warn!(
                "Transient failure ({}/{}): {}; retrying in {:?}",
                failures, self.config.max_retries, err, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("backoff interrupted".to_string()));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
