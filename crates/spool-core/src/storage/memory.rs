//! In-process entry store.
//!
//! Every mutating operation runs inside one write-lock critical section,
//! which gives `claim_batch`, `update` and `reap_stale` the same atomicity a
//! shared database table provides. Several dispatchers (virtual nodes) can
//! share one `Arc<MemoryEntryStore>`.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{EngineKind, EntryStore, ReapPolicy, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{Entry, EntryId, EntryState, NewEntry, NodeId},
    notifier::{CommitNotifier, TransactionEvent},
    time::{Clock, RealClock},
};

#[derive(Debug, Default)]
struct Tables {
    live: BTreeMap<EntryId, Entry>,
    history: BTreeMap<EntryId, Entry>,
    last_id: i64,
}

/// Entry store backed by ordered in-memory maps.
#[derive(Debug)]
pub struct MemoryEntryStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    notifier: Option<CommitNotifier>,
    injected_failures: AtomicU32,
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntryStore {
    /// Creates an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty store stamping times from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            notifier: None,
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Fires `notifier` after every append.
    #[must_use]
    pub fn with_notifier(mut self, notifier: CommitNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Makes the next `count` operations fail with
    /// `CoreError::StoreUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of entries moved to history by [`EntryStore::purge`].
    pub async fn history_len(&self) -> usize {
        self.tables.read().await.history.len()
    }

    /// Snapshot of every live entry in id order.
    pub async fn entries(&self) -> Vec<Entry> {
        self.tables.read().await.live.values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::StoreUnavailable("injected failure".to_string()));
        }
        Ok(())
    }

    async fn append_impl(&self, new: NewEntry) -> Result<Entry> {
        self.check_available()?;
        let now = self.clock.now_utc();

        let entry = {
            let mut tables = self.tables.write().await;
            tables.last_id += 1;
            let entry = Entry {
                id: EntryId(tables.last_id),
                payload: new.payload,
                creating_owner: new.creating_owner,
                processing_owner: None,
                state: EntryState::Available,
                error_count: 0,
                created_time: now,
                updated_time: now,
                next_available_time: now,
                search_keys: new.search_keys,
            };
            tables.live.insert(entry.id, entry.clone());
            entry
        };

        if let Some(notifier) = &self.notifier {
            notifier.fire(&TransactionEvent::committed(entry.creating_owner.clone(), vec![entry.id]));
        }
        Ok(entry)
    }

    async fn claim_impl(
        &self,
        max_count: usize,
        claimer: &NodeId,
        owner_filter: Option<&NodeId>,
    ) -> Result<Vec<Entry>> {
        self.check_available()?;
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_utc();

        let mut tables = self.tables.write().await;
        let claimed = tables
            .live
            .values_mut()
            .filter(|e| e.is_claimable_at(now))
            .filter(|e| owner_filter.map_or(true, |owner| &e.creating_owner == owner))
            .take(max_count)
            .map(|e| {
                e.state = EntryState::InProcessing;
                e.processing_owner = Some(claimer.clone());
                e.updated_time = now;
                e.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn update_impl(&self, claimed: &Entry, next: &Entry) -> Result<()> {
        self.check_available()?;
        let now = self.clock.now_utc();

        let mut tables = self.tables.write().await;
        let stored = tables
            .live
            .get_mut(&claimed.id)
            .ok_or_else(|| CoreError::NotFound(format!("entry {}", claimed.id)))?;

        let same_claim = stored.state == EntryState::InProcessing
            && stored.processing_owner == claimed.processing_owner
            && stored.updated_time == claimed.updated_time;
        if !same_claim {
            return Err(CoreError::ConcurrentModification { id: claimed.id });
        }
        if !stored.state.can_transition_to(next.state) {
            return Err(CoreError::InvalidTransition {
                id: claimed.id,
                from: stored.state,
                to: next.state,
            });
        }

        stored.state = next.state;
        stored.processing_owner = None;
        stored.error_count = stored.error_count.max(next.error_count);
        stored.next_available_time = next.next_available_time;
        stored.updated_time = now;
        Ok(())
    }

    async fn reap_impl(&self, policy: ReapPolicy) -> Result<Vec<Entry>> {
        self.check_available()?;
        let now = self.clock.now_utc();
        let cutoff = claim_cutoff(now, &policy)?;

        let mut tables = self.tables.write().await;
        let reaped: Vec<Entry> = tables
            .live
            .values_mut()
            .filter(|e| e.is_stale_claim(cutoff))
            .map(|e| {
                e.state = policy.reaped_state(e.error_count);
                e.error_count = policy.reaped_error_count(e.error_count);
                e.processing_owner = None;
                e.updated_time = now;
                e.next_available_time = now;
                e.clone()
            })
            .collect();

        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped stale claims");
        }
        Ok(reaped)
    }

    async fn release_impl(&self, owner: &NodeId) -> Result<Vec<Entry>> {
        self.check_available()?;
        let now = self.clock.now_utc();

        let mut tables = self.tables.write().await;
        let released = tables
            .live
            .values_mut()
            .filter(|e| {
                e.state == EntryState::InProcessing && e.processing_owner.as_ref() == Some(owner)
            })
            .map(|e| {
                e.state = EntryState::Available;
                e.processing_owner = None;
                e.updated_time = now;
                e.next_available_time = now;
                e.clone()
            })
            .collect();

        Ok(released)
    }

    async fn purge_impl(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;

        let mut tables = self.tables.write().await;
        let expired: Vec<EntryId> = tables
            .live
            .values()
            .filter(|e| e.state.is_terminal() && e.updated_time < older_than)
            .map(|e| e.id)
            .collect();

        for id in &expired {
            if let Some(entry) = tables.live.remove(id) {
                tables.history.insert(*id, entry);
            }
        }
        Ok(expired.len() as u64)
    }
}

pub(crate) fn claim_cutoff(now: DateTime<Utc>, policy: &ReapPolicy) -> Result<DateTime<Utc>> {
    let timeout = chrono::Duration::from_std(policy.claim_timeout)
        .map_err(|e| CoreError::InvalidInput(format!("claim timeout out of range: {e}")))?;
    now.checked_sub_signed(timeout)
        .ok_or_else(|| CoreError::InvalidInput("claim timeout reaches before epoch".to_string()))
}

impl EntryStore for MemoryEntryStore {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Memory
    }

    fn append(&self, entry: NewEntry) -> StoreFuture<'_, Entry> {
        Box::pin(self.append_impl(entry))
    }

    fn claim_batch<'a>(
        &'a self,
        max_count: usize,
        claimer: &'a NodeId,
        owner_filter: Option<&'a NodeId>,
    ) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(self.claim_impl(max_count, claimer, owner_filter))
    }

    fn update<'a>(&'a self, claimed: &'a Entry, next: &'a Entry) -> StoreFuture<'a, ()> {
        Box::pin(self.update_impl(claimed, next))
    }

    fn reap_stale(&self, policy: ReapPolicy) -> StoreFuture<'_, Vec<Entry>> {
        Box::pin(self.reap_impl(policy))
    }

    fn release_claimed<'a>(&'a self, owner: &'a NodeId) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(self.release_impl(owner))
    }

    fn count_by_state(&self, state: EntryState) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.check_available()?;
            let tables = self.tables.read().await;
            Ok(tables.live.values().filter(|e| e.state == state).count() as u64)
        })
    }

    fn find_by_id(&self, id: EntryId) -> StoreFuture<'_, Option<Entry>> {
        Box::pin(async move {
            self.check_available()?;
            let tables = self.tables.read().await;
            Ok(tables.live.get(&id).or_else(|| tables.history.get(&id)).cloned())
        })
    }

    fn find_by_search_keys<'a>(
        &'a self,
        key1: Option<&'a str>,
        key2: Option<&'a str>,
    ) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(async move {
            self.check_available()?;
            let tables = self.tables.read().await;
            Ok(tables
                .live
                .values()
                .filter(|e| key1.map_or(true, |k| e.search_keys.key1.as_deref() == Some(k)))
                .filter(|e| key2.map_or(true, |k| e.search_keys.key2.as_deref() == Some(k)))
                .cloned()
                .collect())
        })
    }

    fn purge(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(self.purge_impl(older_than))
    }
}
