//! Bounded retry with non-decreasing backoff.
//!
//! [`RetryPolicy::decide`] is a pure function of the error count recorded
//! after a failure. An entry is retried while that count is below
//! `max_failure_retries`; the delay before the next attempt never shrinks as
//! the count grows, with or without jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Retry policy applied when a handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which an entry becomes `FAILED`.
    pub max_failure_retries: u32,

    /// Delay after the first failure.
    pub base_backoff: Duration,

    /// Upper bound on any delay.
    pub max_backoff: Duration,

    /// Upward jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,

    /// Shape of the delay curve.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failure_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    Fixed,
    /// Delay doubles with each failure.
    Exponential,
    /// Delay grows by `base_backoff` with each failure.
    Linear,
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the entry available again at `next_available_time`.
    Retry {
        /// Earliest time the entry may be claimed again
        next_available_time: DateTime<Utc>,
    },
    /// Stop retrying; the entry becomes `FAILED`.
    GiveUp {
        /// Why retrying stopped
        reason: String,
    },
}

impl RetryPolicy {
    /// Decides what happens to an entry whose error count is `error_count`
    /// after a failure observed at `failed_at`.
    pub fn decide(&self, error_count: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if error_count >= self.max_failure_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum failure retries ({}) reached", self.max_failure_retries),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay(error_count)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };
        match failed_at.checked_add_signed(delay) {
            Some(next_available_time) => RetryDecision::Retry { next_available_time },
            None => RetryDecision::GiveUp { reason: "retry time out of range".to_string() },
        }
    }

    /// Un-jittered delay after failure number `error_count` (1-based),
    /// capped at `max_backoff`.
    pub fn backoff(&self, error_count: u32) -> Duration {
        let step = error_count.max(1);
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => Some(self.base_backoff),
            BackoffStrategy::Linear => self.base_backoff.checked_mul(step),
            BackoffStrategy::Exponential => {
                let exponent = (step - 1).min(31);
                self.base_backoff.checked_mul(1_u32 << exponent)
            },
        };

        raw.map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Jittered delay after failure number `error_count`.
    ///
    /// Jitter only adds time and never pushes the delay past the next
    /// step's un-jittered value, which keeps the sequence non-decreasing.
    pub fn delay(&self, error_count: u32) -> Duration {
        let delay = self.backoff(error_count);
        let ceiling = self.backoff(error_count.saturating_add(1));
        apply_jitter(delay, ceiling, self.jitter_factor)
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` for a zero retry budget, a
    /// base delay above the cap, or a jitter factor outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<()> {
        if self.max_failure_retries == 0 {
            return Err(DispatchError::configuration("max_failure_retries must be greater than 0"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(DispatchError::configuration("base backoff cannot exceed max backoff"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DispatchError::configuration("jitter factor must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

fn apply_jitter(delay: Duration, ceiling: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || ceiling <= delay {
        return delay;
    }

    let extra = delay.as_secs_f64() * jitter_factor.min(1.0) * rand::rng().random_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() + extra).clamp(delay, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_failure_retries: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.0,
            backoff_strategy: strategy,
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        let delays: Vec<_> = (1..=8).map(|n| policy.backoff(n).as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = no_jitter(BackoffStrategy::Linear);
        let fixed = no_jitter(BackoffStrategy::Fixed);

        assert_eq!(linear.backoff(3), Duration::from_secs(3));
        assert_eq!(fixed.backoff(7), Duration::from_secs(1));
    }

    #[test]
    fn retry_stops_at_the_limit() {
        let policy = RetryPolicy { max_failure_retries: 3, ..no_jitter(BackoffStrategy::Fixed) };
        let now = Utc::now();

        assert!(matches!(policy.decide(2, now), RetryDecision::Retry { .. }));
        match policy.decide(3, now) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum failure retries")),
            RetryDecision::Retry { .. } => unreachable!("must give up at the limit"),
        }
    }

    #[test]
    fn retry_time_is_failure_time_plus_delay() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        let now = Utc::now();

        assert_eq!(
            policy.decide(3, now),
            RetryDecision::Retry { next_available_time: now + chrono::Duration::seconds(4) }
        );
    }

    #[test]
    fn jitter_stays_between_step_and_next_step() {
        let policy = RetryPolicy { jitter_factor: 1.0, ..no_jitter(BackoffStrategy::Exponential) };

        for _ in 0..50 {
            let delay = policy.delay(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(8));
        }
    }

    #[test]
    fn huge_counts_saturate_at_the_cap() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));

        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn validation_rejects_bad_policies() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_failure_retries: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
