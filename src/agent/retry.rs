//! Exponential backoff for agent invocations

use crate::config::RetrySection;
use rand::Rng;
use std::time::Duration;

/// Attempt budget and backoff shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    /// Scale each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// No waiting between attempts, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::ZERO,
            backoff_factor: 1.0,
            max_interval: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based). Capped at `max_interval`, with optional jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_interval.as_secs_f64();
        let mut delay = base.min(max);

        if self.jitter && delay > 0.0 {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            delay = (delay * factor).min(max);
        }

        if delay.is_finite() && delay > 0.0 {
            Duration::from_secs_f64(delay)
        } else {
            Duration::ZERO
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_interval: Duration::from_millis(section.initial_backoff_ms),
            backoff_factor: section.backoff_factor,
            max_interval: Duration::from_millis(section.max_backoff_ms),
            jitter: section.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_millis(100))
            .with_backoff_factor(2.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(8), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3)
            .with_initial_interval(Duration::from_millis(1000))
            .with_max_interval(Duration::from_secs(60));

        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.calculate_delay(3), Duration::ZERO);
    }
}
