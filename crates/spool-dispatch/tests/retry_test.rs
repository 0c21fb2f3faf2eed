//! Property tests for retry decisions.

use chrono::Utc;
use proptest::prelude::*;
use spool_dispatch::{RetryDecision, RetryPolicy};
use spool_testing::{strategies, Invariants};

proptest! {
    #[test]
    fn delays_never_shrink(policy in strategies::retry_policy()) {
        let delays: Vec<_> = (1..=40).map(|n| policy.delay(n)).collect();
        prop_assert!(Invariants::non_decreasing(&delays).is_ok(), "{delays:?}");
    }

    #[test]
    fn delays_respect_the_cap(policy in strategies::retry_policy(), count in 1..64_u32) {
        prop_assert!(policy.delay(count) <= policy.max_backoff);
        prop_assert!(policy.delay(count) >= policy.backoff(count));
    }

    #[test]
    fn retry_iff_below_limit(policy in strategies::retry_policy(), count in 0..40_u32) {
        let now = Utc::now();
        match policy.decide(count, now) {
            RetryDecision::Retry { next_available_time } => {
                prop_assert!(count < policy.max_failure_retries);
                prop_assert!(next_available_time >= now);
            },
            RetryDecision::GiveUp { .. } => prop_assert!(count >= policy.max_failure_retries),
        }
    }
}

#[test]
fn default_policy_is_valid() {
    assert!(RetryPolicy::default().validate().is_ok());
}
