use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// `min(initial * multiplier^attempts, max)`, where `attempts` counts the
    /// failures so far including the one being retried.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .checked_pow(attempts)
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay_ms: u64,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Linear backoff: the n-th reconnect attempt waits `delay * n`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8_000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10_000));
        assert_eq!(config.delay_for_attempt(90), Duration::from_millis(10_000));
    }

    #[test]
    fn reconnect_delay_grows_linearly() {
        let policy = ReconnectPolicy {
            delay_ms: 500,
            max_attempts: 4,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1_500));
    }
}
