//! Reconnection backoff for the push channel.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with optional full jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Ceiling of the first reconnection delay.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Growth factor of the ceiling per attempt.
    pub multiplier: f64,
    /// Draw the actual delay uniformly from `[0, ceiling]`.
    pub jitter: bool,
    /// Maximum number of consecutive failed attempts (None = infinite).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Set the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Limit the number of consecutive failed attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Upper bound of the delay for the given attempt: `min(cap, base * multiplier^(attempt-1))`.
    #[must_use]
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Delay to wait before the given attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        if !self.jitter {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_reconnect(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_ceiling_for_attempt() {
        let config = BackoffConfig::default();

        assert_eq!(config.ceiling_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.ceiling_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.ceiling_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.ceiling_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.ceiling_for_attempt(6), Duration::from_secs(30)); // capped
        assert_eq!(config.ceiling_for_attempt(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_attempt_uses_base() {
        let config = BackoffConfig::default();
        assert_eq!(config.ceiling_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_without_jitter_is_ceiling() {
        let config = BackoffConfig::default().with_jitter(false);

        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_should_reconnect_limited() {
        let config = BackoffConfig::default().with_max_attempts(3);

        assert!(config.should_reconnect(1));
        assert!(config.should_reconnect(2));
        assert!(!config.should_reconnect(3));
    }

    #[test]
    fn test_builder() {
        let config = BackoffConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(3.0);

        assert_eq!(config.ceiling_for_attempt(2), Duration::from_millis(300));
        assert_eq!(config.ceiling_for_attempt(10), Duration::from_secs(5));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn jittered_delay_within_ceiling(attempt in 0u32..40) {
                let config = BackoffConfig::default();
                let delay = config.delay_for_attempt(attempt);
                prop_assert!(delay <= config.ceiling_for_attempt(attempt));
                prop_assert!(delay <= config.max_delay);
            }

            #[test]
            fn ceiling_is_monotonic(attempt in 1u32..40) {
                let config = BackoffConfig::default();
                prop_assert!(config.ceiling_for_attempt(attempt) <= config.ceiling_for_attempt(attempt + 1));
            }
        }
    }
}
