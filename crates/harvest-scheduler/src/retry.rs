use std::time::Duration;

use harvest_core::config::RetryConfig;
use harvest_store::ExecutionStatus;

/// Pure retry policy: whether a finished attempt earns another try, and how
/// long to wait before it.
///
/// Retries are numbered from 1 — the first retry after the initial attempt
/// is attempt 1 — and the delay doubles per retry from `base` up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            cap: Duration::from_secs(config.cap_secs),
        }
    }

    /// Decide whether retry number `attempt` should happen for a task with
    /// the given retry settings.
    ///
    /// Only failures and timeouts are retried; a cancelled attempt was
    /// stopped on purpose and stays stopped. `max_retries` bounds the number
    /// of retries per trigger, so a task with `max_retries = 2` can run at
    /// most three times for one fire.
    pub fn should_retry(
        &self,
        status: ExecutionStatus,
        attempt: u32,
        retry_on_failure: bool,
        max_retries: u32,
    ) -> bool {
        if !retry_on_failure || attempt > max_retries {
            return false;
        }
        matches!(status, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let secs = self.base.as_secs().saturating_mul(factor);
        Duration::from_secs(secs.min(self.cap.as_secs()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
