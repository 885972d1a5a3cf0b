// src/retry.rs

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff settings shared by every job of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before the attempt that follows attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`, optionally jittered
    /// uniformly over `[0, capped]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let candidate = self.base_delay.checked_mul(exp).unwrap_or(self.max_delay);
        let capped = self.max_delay.min(candidate);
        if self.jitter {
            jitter(capped)
        } else {
            capped
        }
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

fn jitter(duration: Duration) -> Duration {
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
}
