//! Storage contract for durable entries.
//!
//! Every backend implements [`EntryStore`]. The dispatch engine relies only
//! on the atomicity of `claim_batch`, `update` and `reap_stale` for
//! cross-node correctness: no two concurrent callers may receive the same
//! entry from `claim_batch`, and `update` must reject a caller whose claim is
//! no longer the stored version.
//!
//! Backend identity is reported through [`EntryStore::engine_kind`] rather
//! than discovered by downcasting.

use std::{fmt, future::Future, pin::Pin, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{Entry, EntryId, EntryState, NewEntry, NodeId},
};

pub mod memory;
pub mod postgres;

/// Boxed future returned by [`EntryStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Backend behind an [`EntryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// In-process map, single node.
    Memory,
    /// PostgreSQL table shared by every node.
    Postgres,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Postgres => f.write_str("postgres"),
        }
    }
}

/// Parameters for [`EntryStore::reap_stale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Claims older than this are considered orphaned.
    pub claim_timeout: Duration,
    /// Reaped entries whose error count has reached this limit become
    /// `REAPED` instead of `AVAILABLE`.
    pub max_failure_retries: u32,
    /// Counts the reap itself as a failed attempt.
    pub penalize: bool,
}

impl ReapPolicy {
    /// Error count an entry carries after being reaped under this policy.
    pub fn reaped_error_count(&self, error_count: u32) -> u32 {
        if self.penalize {
            error_count.saturating_add(1)
        } else {
            error_count
        }
    }

    /// State a reaped entry with `error_count` (before any penalty) lands in.
    pub fn reaped_state(&self, error_count: u32) -> EntryState {
        if self.reaped_error_count(error_count) < self.max_failure_retries {
            EntryState::Available
        } else {
            EntryState::Reaped
        }
    }
}

/// Durable entry storage shared by every node of a bus.
pub trait EntryStore: Send + Sync + 'static {
    /// Reports which backend this is.
    fn engine_kind(&self) -> EngineKind;

    /// Durably inserts a new `AVAILABLE` entry with `error_count = 0` and
    /// `next_available_time = now`, returning the stored record.
    ///
    /// Backends with an attached commit notifier fire it once the insert has
    /// committed.
    fn append(&self, entry: NewEntry) -> StoreFuture<'_, Entry>;

    /// Atomically claims up to `max_count` claimable entries in id order.
    ///
    /// Claimed entries move to `IN_PROCESSING` owned by `claimer` with
    /// `updated_time = now`. With `owner_filter` set, only entries created by
    /// that node are considered.
    fn claim_batch<'a>(
        &'a self,
        max_count: usize,
        claimer: &'a NodeId,
        owner_filter: Option<&'a NodeId>,
    ) -> StoreFuture<'a, Vec<Entry>>;

    /// Replaces the state, owner, error count and next availability of a
    /// claimed entry with those of `next`; `updated_time` is stamped by the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConcurrentModification` if the stored entry is no
    /// longer `IN_PROCESSING` under `claimed`'s owner and `updated_time`, and
    /// `CoreError::InvalidTransition` if `next.state` is not reachable from
    /// `IN_PROCESSING`.
    fn update<'a>(&'a self, claimed: &'a Entry, next: &'a Entry) -> StoreFuture<'a, ()>;

    /// Atomically returns orphaned claims to circulation.
    ///
    /// Entries `IN_PROCESSING` with `updated_time` older than
    /// `policy.claim_timeout` become `AVAILABLE` (or `REAPED` once their
    /// error count has reached the limit), with the owner cleared and
    /// `updated_time = next_available_time = now`. Returns the reaped
    /// entries in their new state.
    fn reap_stale(&self, policy: ReapPolicy) -> StoreFuture<'_, Vec<Entry>>;

    /// Returns every `IN_PROCESSING` entry held by `owner` to `AVAILABLE`.
    fn release_claimed<'a>(&'a self, owner: &'a NodeId) -> StoreFuture<'a, Vec<Entry>>;

    /// Counts entries in `state`.
    fn count_by_state(&self, state: EntryState) -> StoreFuture<'_, u64>;

    /// Finds one entry.
    fn find_by_id(&self, id: EntryId) -> StoreFuture<'_, Option<Entry>>;

    /// Finds entries whose search keys match every key given.
    fn find_by_search_keys<'a>(
        &'a self,
        key1: Option<&'a str>,
        key2: Option<&'a str>,
    ) -> StoreFuture<'a, Vec<Entry>>;

    /// Moves terminal entries last updated before `older_than` into history,
    /// returning how many moved.
    fn purge(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_without_penalty_keeps_error_count() {
        let policy = ReapPolicy {
            claim_timeout: Duration::from_secs(30),
            max_failure_retries: 3,
            penalize: false,
        };

        assert_eq!(policy.reaped_error_count(2), 2);
        assert_eq!(policy.reaped_state(2), EntryState::Available);
        assert_eq!(policy.reaped_state(3), EntryState::Reaped);
    }

    #[test]
    fn penalized_reap_counts_as_an_attempt() {
        let policy = ReapPolicy {
            claim_timeout: Duration::from_secs(30),
            max_failure_retries: 3,
            penalize: true,
        };

        assert_eq!(policy.reaped_error_count(2), 3);
        assert_eq!(policy.reaped_state(1), EntryState::Available);
        assert_eq!(policy.reaped_state(2), EntryState::Reaped);
    }
}
