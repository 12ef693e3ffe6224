//! Backoff policy for rate-limited image fetches.
//!
//! A 429 is not a failure: the task goes back on the image channel and the
//! worker that saw it pauses. The pause doubles with every further 429 for the
//! same task, and a task that keeps getting throttled is eventually abandoned.

use crate::config::PipelineConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// 1-indexed number of the attempt that will follow the pause
        attempt: u32,
    },
    GiveUp {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    /// Attempts including the first one
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.rate_limit_base_delay,
            config.rate_limit_max_delay,
            config.rate_limit_max_attempts,
        )
    }

    /// Pause after the given 1-indexed failed attempt: `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `attempts_made` counts the attempt that was just rate limited.
    pub fn on_rate_limited(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("still rate limited after {attempts_made} attempts"),
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts_made),
            attempt: attempts_made + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 4)
    }

    #[test]
    fn delay_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(2), Duration::from_secs(20));
        assert_eq!(p.delay_for(3), Duration::from_secs(40));
        assert_eq!(p.delay_for(4), Duration::from_secs(60));
        assert_eq!(p.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn retries_below_limit() {
        assert_eq!(
            policy().on_rate_limited(1),
            RetryDecision::Retry {
                delay: Duration::from_secs(10),
                attempt: 2
            }
        );
    }

    #[test]
    fn gives_up_at_limit() {
        match policy().on_rate_limited(4) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("4 attempts")),
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let p = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 1);
        assert!(matches!(p.on_rate_limited(1), RetryDecision::GiveUp { .. }));
    }
}
