//! Replication configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::batch::MAX_BATCH_SIZE;
use crate::retry::RetryConfig;

/// Shortest retry delay honoured; smaller settings are raised to it.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration shared by every replication task of a supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Interval between scheduled sync passes.
    pub live_interval: Duration,
    /// Interval between scheduled audit passes.
    pub audit_interval: Duration,
    /// First delay before re-running a task whose last scheduled run failed
    /// (at least [`MIN_RETRY_DELAY`]).
    pub retry_delay: Duration,
    /// Maximum ids listed in one pull filter (clamped to 1..=1000).
    pub batch_limit: usize,
    /// Retries of a transient request failure inside a single run.
    pub request_retries: u32,
    /// Manual triggers buffered while a run is in flight.
    pub trigger_queue: usize,
    /// Spread retry delays by +/- 25%.
    pub jitter: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            live_interval: Duration::from_secs(600),
            audit_interval: Duration::from_secs(600),
            retry_delay: Duration::from_secs(5),
            batch_limit: MAX_BATCH_SIZE,
            request_retries: 2,
            trigger_queue: 8,
            jitter: true,
        }
    }
}

impl ReplicationConfig {
    /// Set the sync interval.
    pub fn with_live_interval(mut self, interval: Duration) -> Self {
        self.live_interval = interval;
        self
    }

    /// Set the audit interval.
    pub fn with_audit_interval(mut self, interval: Duration) -> Self {
        self.audit_interval = interval;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the batch limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set in-run request retries.
    pub fn with_request_retries(mut self, retries: u32) -> Self {
        self.request_retries = retries;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Batch limit within the hard request-size bound.
    pub fn effective_batch_limit(&self) -> usize {
        self.batch_limit.clamp(1, MAX_BATCH_SIZE)
    }

    /// Retry delay raised to [`MIN_RETRY_DELAY`].
    pub fn effective_retry_delay(&self) -> Duration {
        self.retry_delay.max(MIN_RETRY_DELAY)
    }

    /// Backoff for retrying a request inside one run.
    pub fn request_retry(&self) -> RetryConfig {
        let delay = self.effective_retry_delay();
        RetryConfig::new(self.request_retries)
            .with_initial_delay(delay / 10)
            .with_max_delay(delay)
            .with_jitter(self.jitter)
    }

    /// Backoff for rescheduling a task after failed runs, capped at `interval`.
    pub fn run_backoff(&self, interval: Duration) -> RetryConfig {
        let interval = interval.max(MIN_RETRY_DELAY);
        RetryConfig::new(u32::MAX)
            .with_initial_delay(self.effective_retry_delay().min(interval))
            .with_max_delay(interval)
            .with_jitter(self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.live_interval, Duration::from_secs(600));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.effective_batch_limit(), 1000);
    }

    #[test]
    fn test_batch_limit_clamped() {
        assert_eq!(
            ReplicationConfig::default()
                .with_batch_limit(5000)
                .effective_batch_limit(),
            1000
        );
        assert_eq!(
            ReplicationConfig::default()
                .with_batch_limit(0)
                .effective_batch_limit(),
            1
        );
    }

    #[test]
    fn test_run_backoff_capped_at_interval() {
        let config = ReplicationConfig::default().with_jitter(false);
        let backoff = config.run_backoff(Duration::from_secs(60));

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_retry_delay_raised_to_floor() {
        let config = ReplicationConfig::default()
            .with_retry_delay(Duration::ZERO)
            .with_jitter(false);
        assert_eq!(config.effective_retry_delay(), MIN_RETRY_DELAY);

        let between_runs = config.run_backoff(Duration::from_secs(600));
        assert_eq!(between_runs.delay_for_attempt(0), MIN_RETRY_DELAY);

        let in_run = config.request_retry();
        assert_eq!(in_run.delay_for_attempt(0), MIN_RETRY_DELAY / 10);
        assert_eq!(in_run.delay_for_attempt(10), MIN_RETRY_DELAY);

        // Even a zero interval does not let runs repeat back to back.
        let zero_interval = config.run_backoff(Duration::ZERO);
        assert_eq!(zero_interval.delay_for_attempt(3), MIN_RETRY_DELAY);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{ "batch_limit": 250, "jitter": false }"#).unwrap();
        assert_eq!(config.batch_limit, 250);
        assert!(!config.jitter);
        assert_eq!(config.request_retries, 2);
    }
}
