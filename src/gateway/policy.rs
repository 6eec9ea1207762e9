//! Retry policy for rate-limited calls

use rand::Rng;
use std::time::Duration;

/// Jitter added on top of a provider retry hint
pub const HINT_JITTER: Duration = Duration::from_millis(1000);

/// Exponential backoff settings, fixed for the lifetime of a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    /// Delay scale for the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    /// Growth factor per attempt
    pub factor: f64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            max_retries: 3,
            factor: 2.0,
        }
    }
}

impl RateLimitPolicy {
    /// Delay before the retry following `attempt` (0-indexed), using a fresh
    /// random sample.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let unit: f64 = rand::rng().random();
        self.delay_with_sample(attempt, retry_after, unit)
    }

    /// Delay computation with the random sample supplied by the caller.
    ///
    /// With a retry hint the hint is honored plus up to one second of jitter;
    /// without one the delay is full-jitter exponential. Both are capped at
    /// `max_delay`.
    pub fn delay_with_sample(&self, attempt: u32, retry_after: Option<Duration>, unit: f64) -> Duration {
        let unit = unit.clamp(0.0, 1.0);
        let delay = match retry_after {
            Some(hint) => hint + HINT_JITTER.mul_f64(unit),
            None => {
                let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
                let ceiling = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
                Duration::from_secs_f64(ceiling.max(0.0) * unit)
            }
        };
        delay.min(self.max_delay)
    }
}
