//! Invariant checks and property-based testing utilities.

use std::{collections::HashSet, time::Duration};

use anyhow::{ensure, Result};
use spool_core::{Entry, EntryState};

/// Entry-level invariants every store and dispatcher must preserve.
pub struct Invariants;

impl Invariants {
    /// No entry appears in more than one claimed batch.
    pub fn no_duplicate_claims(batches: &[Vec<Entry>]) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in batches.iter().flatten() {
            ensure!(seen.insert(entry.id), "entry {} was claimed twice", entry.id);
        }
        Ok(())
    }

    /// A processing owner is set exactly when the entry is `IN_PROCESSING`.
    pub fn ownership_consistent(entries: &[Entry]) -> Result<()> {
        for entry in entries {
            ensure!(
                entry.ownership_consistent(),
                "entry {} is {} with processing owner {:?}",
                entry.id,
                entry.state,
                entry.processing_owner
            );
        }
        Ok(())
    }

    /// Error counts never exceed the retry limit, and an entry at the limit
    /// is never claimable again.
    pub fn retry_count_bounded(entries: &[Entry], max_failure_retries: u32) -> Result<()> {
        for entry in entries {
            ensure!(
                entry.error_count <= max_failure_retries,
                "entry {} exceeded the retry limit: {} > {}",
                entry.id,
                entry.error_count,
                max_failure_retries
            );
            ensure!(
                entry.error_count < max_failure_retries || entry.state != EntryState::Available,
                "entry {} is AVAILABLE with an exhausted retry budget",
                entry.id
            );
        }
        Ok(())
    }

    /// The move from `before` to `after` follows the lifecycle graph and
    /// leaves identity, payload and error history intact.
    pub fn transition_valid(before: &Entry, after: &Entry) -> Result<()> {
        ensure!(before.id == after.id, "entry id changed: {} -> {}", before.id, after.id);
        ensure!(before.payload == after.payload, "payload of entry {} changed", before.id);
        ensure!(
            after.error_count >= before.error_count,
            "error count of entry {} decreased: {} -> {}",
            before.id,
            before.error_count,
            after.error_count
        );
        ensure!(
            before.state == after.state || before.state.can_transition_to(after.state),
            "entry {} moved {} -> {}",
            before.id,
            before.state,
            after.state
        );
        Ok(())
    }

    /// Every entry reached a terminal state.
    pub fn all_terminal(entries: &[Entry]) -> Result<()> {
        for entry in entries {
            ensure!(entry.state.is_terminal(), "entry {} is still {}", entry.id, entry.state);
        }
        Ok(())
    }

    /// Successive delays never shrink.
    pub fn non_decreasing(delays: &[Duration]) -> Result<()> {
        for (step, pair) in delays.windows(2).enumerate() {
            ensure!(
                pair[1] >= pair[0],
                "delay shrank after failure {}: {:?} -> {:?}",
                step + 1,
                pair[0],
                pair[1]
            );
        }
        Ok(())
    }
}

/// Proptest strategies for bus types.
pub mod strategies {
    use std::time::Duration;

    use proptest::prelude::{prop_oneof, Just, Strategy};
    use spool_core::{EntryState, NodeId};
    use spool_dispatch::{BackoffStrategy, PersistentQueueMode, RetryPolicy};

    /// Any backoff strategy.
    pub fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Exponential),
        ]
    }

    /// Any queue mode.
    pub fn queue_mode() -> impl Strategy<Value = PersistentQueueMode> {
        prop_oneof![
            Just(PersistentQueueMode::Polling),
            Just(PersistentQueueMode::StickyPolling),
            Just(PersistentQueueMode::StickyEvents),
        ]
    }

    /// Any entry state.
    pub fn entry_state() -> impl Strategy<Value = EntryState> {
        proptest::sample::select(EntryState::ALL.to_vec())
    }

    /// Valid retry policies with base delay at or below the cap.
    pub fn retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (1..20_u32, 1..5_000_u64, 0..600_000_u64, 0.0..=1.0_f64, backoff_strategy()).prop_map(
            |(max_failure_retries, base_ms, extra_ms, jitter_factor, backoff_strategy)| {
                RetryPolicy {
                    max_failure_retries,
                    base_backoff: Duration::from_millis(base_ms),
                    max_backoff: Duration::from_millis(base_ms + extra_ms),
                    jitter_factor,
                    backoff_strategy,
                }
            },
        )
    }

    /// One of `count` virtual node ids.
    pub fn node_id(count: usize) -> impl Strategy<Value = NodeId> {
        (0..count.max(1)).prop_map(|i| NodeId::new(format!("node-{i}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::EntryBuilder;

    #[test]
    fn duplicate_claims_are_detected() {
        let first = vec![EntryBuilder::new(1).claimed_by("a").build()];
        let second = vec![EntryBuilder::new(1).claimed_by("b").build()];

        assert!(Invariants::no_duplicate_claims(&[first.clone()]).is_ok());
        assert!(Invariants::no_duplicate_claims(&[first, second]).is_err());
    }

    #[test]
    fn terminal_entries_cannot_become_available() {
        let failed = EntryBuilder::new(1).state(EntryState::Failed).build();
        let revived = EntryBuilder::new(1).state(EntryState::Available).build();
        let revived = Entry { payload: failed.payload.clone(), ..revived };

        assert!(Invariants::transition_valid(&failed, &revived).is_err());
    }

    #[test]
    fn exhausted_available_entry_violates_retry_bound() {
        let entry = EntryBuilder::new(1).error_count(3).build();
        assert!(Invariants::retry_count_bounded(&[entry], 3).is_err());
    }
}
