use std::time::Duration;

use crate::config::DispatcherConfig;

/// Exponential backoff keyed by attempt count: `base * 2^(attempt - 1)`,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.retry_base_delay, config.retry_max_delay)
    }

    /// Delay before the row becomes eligible again after `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt_until_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(500), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(60));
        assert_eq!(policy.delay(0), Duration::from_millis(250));
    }
}
