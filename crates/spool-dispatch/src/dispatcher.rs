//! The per-node dispatch engine.
//!
//! One claim loop feeds a bounded queue; a fixed worker pool drains it; a
//! reaper returns orphaned claims of any node to circulation. The claim loop
//! never claims more than the queue can take, so entries sit in the store
//! rather than in memory when workers fall behind.

use std::{sync::Arc, time::Instant};

use futures::future::join_all;
use spool_core::{
    Clock, CommitNotifier, Entry, EntryId, EntryStore, NewEntry, NodeId, NotificationSubscription,
    RealClock, SearchKeys,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    callback::{encode_event, BusEvent, DispatchCallback, HandlerRegistry},
    claim::ClaimManager,
    config::{DispatchConfig, PersistentQueueMode},
    error::{DispatchError, ErrorCategory, Result},
    worker::EntryProcessor,
    worker_pool::WorkerPool,
};

/// Counters describing a dispatcher's activity since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Entries claimed by this node.
    pub claimed: u64,
    /// Entries resolved as `PROCESSED`.
    pub processed: u64,
    /// Handler failures that scheduled a retry.
    pub retried: u64,
    /// Entries resolved as `FAILED`.
    pub failed: u64,
    /// Resolutions rejected because the entry was resolved elsewhere.
    pub lost_races: u64,
    /// Entries currently inside a handler.
    pub in_flight: u64,
    /// Running worker tasks.
    pub active_workers: usize,
    /// Claim cycles skipped because the queue lacked room for a full batch.
    pub skipped_claim_cycles: u64,
    /// Claims of any node returned to circulation by this node's reaper.
    pub reaped: u64,
    /// Failed store calls in the claim loop, the reaper or the workers.
    pub store_errors: u64,
}

/// Dispatch engine for one node.
pub struct Dispatcher {
    node_id: NodeId,
    store: Arc<dyn EntryStore>,
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    notifier: Option<CommitNotifier>,
    claims: ClaimManager,
    processor: Arc<EntryProcessor>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    background: Vec<JoinHandle<()>>,
    started: bool,
}

impl Dispatcher {
    /// Creates a dispatcher for `node_id` over `store`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if `config` is invalid.
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn EntryStore>,
        registry: HandlerRegistry,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let stats = Arc::new(RwLock::new(DispatchStats::default()));
        let claims = ClaimManager::new(
            store.clone(),
            node_id.clone(),
            config.mode,
            config.reap_policy(),
        );
        let processor = Self::build_processor(&store, &registry, &config, &clock, &stats);

        Ok(Self {
            node_id,
            store,
            registry,
            config,
            clock,
            notifier: None,
            claims,
            processor,
            stats,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            background: Vec::new(),
            started: false,
        })
    }

    /// Replaces the clock used for retry times and loop cadences.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.processor =
            Self::build_processor(&self.store, &self.registry, &self.config, &clock, &self.stats);
        self.clock = clock;
        self
    }

    /// Attaches the notifier the store fires on commit. Required for
    /// `STICKY_EVENTS`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: CommitNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn build_processor(
        store: &Arc<dyn EntryStore>,
        registry: &Arc<HandlerRegistry>,
        config: &DispatchConfig,
        clock: &Arc<dyn Clock>,
        stats: &Arc<RwLock<DispatchStats>>,
    ) -> Arc<EntryProcessor> {
        let callback =
            DispatchCallback::new(registry.clone(), config.retry_policy.clone(), clock.clone());
        Arc::new(EntryProcessor::new(store.clone(), callback, stats.clone()))
    }

    /// This node's identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Starts the claim loop, the reaper and the worker pool.
    ///
    /// With `is_processing_off` set nothing is started; `post` keeps
    /// working.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` when `STICKY_EVENTS` is
    /// configured without a notifier, and `DispatchError::Internal` if the
    /// dispatcher was already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DispatchError::internal("dispatcher already started"));
        }
        if self.config.is_processing_off {
            info!(node_id = %self.node_id, "processing is off, dispatcher accepts appends only");
            self.started = true;
            return Ok(());
        }

        let subscription = match (self.config.mode, &self.notifier) {
            (PersistentQueueMode::StickyEvents, Some(notifier)) => Some(notifier.subscribe()),
            (PersistentQueueMode::StickyEvents, None) => {
                return Err(DispatchError::configuration(
                    "STICKY_EVENTS mode requires a commit notifier",
                ));
            },
            _ => None,
        };

        info!(
            node_id = %self.node_id,
            engine = %self.store.engine_kind(),
            mode = %self.config.mode,
            workers = self.config.max_dispatch_threads,
            max_entries_claimed = self.config.max_entries_claimed,
            "starting dispatcher"
        );

        let (sender, receiver) = mpsc::channel(self.config.event_queue_capacity);
        let mut pool = WorkerPool::new(
            self.config.max_dispatch_threads,
            Arc::new(Mutex::new(receiver)),
            self.processor.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );
        pool.spawn_workers().await;
        self.worker_pool = Some(pool);

        let claim_loop = ClaimLoop {
            claims: self.claims.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            sender,
            subscription,
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
        };
        self.background.push(tokio::spawn(claim_loop.run()));

        let reaper = Reaper {
            claims: self.claims.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
        };
        self.background.push(tokio::spawn(reaper.run()));

        self.started = true;
        info!(node_id = %self.node_id, "dispatcher started");
        Ok(())
    }

    /// Encodes `event` and appends it with this node as creating owner.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be encoded or the append fails.
    pub async fn post<E: BusEvent>(&self, event: &E, search_keys: SearchKeys) -> Result<EntryId> {
        let payload = encode_event(event)?;
        let entry = self
            .store
            .append(NewEntry::new(payload, self.node_id.clone()).with_search_keys(search_keys))
            .await?;
        debug!(entry_id = %entry.id, event_type = E::EVENT_TYPE, "event posted");
        Ok(entry.id)
    }

    /// Runs one claim and dispatch cycle on the calling task.
    ///
    /// Returns the number of entries claimed; each has been resolved when
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::StoreUnavailable` if the claim fails.
    pub async fn process_once(&self) -> Result<usize> {
        let entries = self.claims.claim(self.config.max_entries_claimed).await?;
        let count = entries.len();
        self.stats.write().await.claimed += count as u64;

        for entry in entries {
            self.processor.process(entry).await;
        }
        Ok(count)
    }

    /// Runs one reap cycle on the calling task.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::StoreUnavailable` if the reap fails.
    pub async fn reap_once(&self) -> Result<usize> {
        let reaped = self.claims.reap().await?.len();
        self.stats.write().await.reaped += reaped as u64;
        Ok(reaped)
    }

    /// Snapshot of the activity counters.
    pub async fn stats(&self) -> DispatchStats {
        let mut stats = self.stats.read().await.clone();
        stats.in_flight = self.processor.in_flight();
        stats
    }

    /// Stops the dispatcher.
    ///
    /// Cancels the claim loop and reaper, lets workers finish their current
    /// entry for up to `shutdown_timeout`, aborts what remains, and returns
    /// every entry this node still holds to `AVAILABLE`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if the grace period was
    /// exceeded, or `DispatchError::StoreUnavailable` if releasing claims
    /// failed.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            node_id = %self.node_id,
            timeout_seconds = timeout.as_secs_f64(),
            "shutting down dispatcher"
        );

        let started_at = Instant::now();
        self.cancellation_token.cancel();
        let mut timed_out = false;

        let background = std::mem::take(&mut self.background);
        let abort_handles: Vec<_> = background.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, join_all(background)).await.is_err() {
            abort_handles.iter().for_each(tokio::task::AbortHandle::abort);
            timed_out = true;
        }

        if let Some(pool) = self.worker_pool.take() {
            let remaining = timeout.saturating_sub(started_at.elapsed());
            match pool.shutdown_graceful(remaining).await {
                Ok(()) => {},
                Err(DispatchError::ShutdownTimeout { .. }) => timed_out = true,
                Err(other) => warn!(error = %other, "worker pool shutdown failed"),
            }
        }

        let released = match self.store.release_claimed(&self.node_id).await {
            Err(e) if e.is_transient() => {
                warn!(node_id = %self.node_id, error = %e, "releasing claims failed, retrying once");
                self.store.release_claimed(&self.node_id).await
            },
            other => other,
        }
        .map_err(|e| {
            error!(node_id = %self.node_id, error = %e, "failed to release claimed entries");
            DispatchError::from(e)
        })?;
        if !released.is_empty() {
            info!(node_id = %self.node_id, released = released.len(), "released claimed entries");
        }

        if timed_out {
            return Err(DispatchError::ShutdownTimeout { timeout });
        }
        info!(node_id = %self.node_id, "dispatcher stopped");
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled()
            && (self.worker_pool.is_some() || !self.background.is_empty())
        {
            warn!(
                node_id = %self.node_id,
                "dispatcher dropped without shutdown, claimed entries wait for the reaper"
            );
            self.cancellation_token.cancel();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("node_id", &self.node_id)
            .field("engine", &self.store.engine_kind())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Trigger loop moving claimed entries into the internal queue.
struct ClaimLoop {
    claims: ClaimManager,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    sender: mpsc::Sender<Entry>,
    subscription: Option<NotificationSubscription>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
}

impl ClaimLoop {
    async fn run(mut self) {
        debug!(mode = %self.config.mode, "claim loop starting");

        while !self.cancellation_token.is_cancelled() {
            if self.cycle().await {
                tokio::task::yield_now().await;
                continue;
            }
            if !self.wait_for_trigger().await {
                break;
            }
        }

        debug!("claim loop stopped");
    }

    /// Runs one claim cycle. Returns whether a full batch was claimed.
    async fn cycle(&mut self) -> bool {
        let max = self.config.max_entries_claimed;
        if self.sender.capacity() < max {
            debug!(free = self.sender.capacity(), max, "queue lacks room for a batch, skipping claim");
            self.stats.write().await.skipped_claim_cycles += 1;
            return false;
        }

        let entries = match self.claims.claim(max).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    category = %ErrorCategory::from(&error),
                    retryable = error.is_retryable(),
                    error = %error,
                    "claim cycle failed, retrying next tick"
                );
                self.stats.write().await.store_errors += 1;
                return false;
            },
        };

        let count = entries.len();
        self.stats.write().await.claimed += count as u64;
        for entry in entries {
            if self.sender.send(entry).await.is_err() {
                // Workers are gone; shutdown releases whatever is still claimed.
                return false;
            }
        }
        count == max
    }

    /// Waits for the next trigger. Returns `false` once cancelled.
    async fn wait_for_trigger(&mut self) -> bool {
        let interval = match self.config.mode {
            PersistentQueueMode::Polling | PersistentQueueMode::StickyPolling => {
                self.config.polling_sleep_time
            },
            PersistentQueueMode::StickyEvents => self.config.sticky_events_fallback,
        };
        let node_id = self.claims.node_id().clone();
        let token = self.cancellation_token.clone();
        let clock = self.clock.clone();

        tokio::select! {
            biased;
            () = token.cancelled() => false,
            () = wait_for_local_commit(self.subscription.as_mut(), &node_id) => true,
            () = clock.sleep(interval) => true,
        }
    }
}

/// Resolves once a commit by `node_id` is seen; pends forever without a
/// subscription.
async fn wait_for_local_commit(subscription: Option<&mut NotificationSubscription>, node_id: &NodeId) {
    let Some(subscription) = subscription else {
        return std::future::pending().await;
    };

    loop {
        let Some(event) = subscription.recv().await else {
            return std::future::pending().await;
        };
        let mut local = event.owner == *node_id;
        local |= subscription.drain().iter().any(|e| e.owner == *node_id);
        if local {
            return;
        }
    }
}

/// Periodic recovery of orphaned claims.
struct Reaper {
    claims: ClaimManager,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
}

impl Reaper {
    async fn run(self) {
        debug!(interval_seconds = self.config.reaper_interval.as_secs_f64(), "reaper starting");

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.config.reaper_interval) => {},
            }

            match self.claims.reap().await {
                Ok(reaped) => self.stats.write().await.reaped += reaped.len() as u64,
                Err(error) => {
                    warn!(
                        category = %ErrorCategory::from(&error),
                        retryable = error.is_retryable(),
                        error = %error,
                        "reap cycle failed, retrying next tick"
                    );
                    self.stats.write().await.store_errors += 1;
                },
            }
        }

        debug!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spool_core::{EntryState, MemoryEntryStore, Payload};

    use super::*;

    fn config() -> DispatchConfig {
        DispatchConfig {
            max_entries_claimed: 2,
            event_queue_capacity: 2,
            polling_sleep_time: Duration::from_millis(10),
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let store = Arc::new(MemoryEntryStore::new());
        let config = DispatchConfig { max_dispatch_threads: 0, ..DispatchConfig::default() };

        let err = Dispatcher::new(NodeId::new("a"), store, HandlerRegistry::new(), config)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration { .. }));
    }

    #[tokio::test]
    async fn sticky_events_requires_notifier() {
        let store = Arc::new(MemoryEntryStore::new());
        let config = DispatchConfig { mode: PersistentQueueMode::StickyEvents, ..config() };
        let mut dispatcher =
            Dispatcher::new(NodeId::new("a"), store, HandlerRegistry::new(), config).unwrap();

        assert!(matches!(dispatcher.start().await, Err(DispatchError::Configuration { .. })));
        dispatcher.shutdown().await.unwrap();
    }

    fn claim_loop(
        store: Arc<MemoryEntryStore>,
        stats: Arc<RwLock<DispatchStats>>,
    ) -> (ClaimLoop, mpsc::Receiver<Entry>) {
        let config = config();
        let (sender, receiver) = mpsc::channel(config.event_queue_capacity);
        let claim_loop = ClaimLoop {
            claims: ClaimManager::new(store, NodeId::new("a"), config.mode, config.reap_policy()),
            config,
            clock: Arc::new(RealClock::new()),
            sender,
            subscription: None,
            stats,
            cancellation_token: CancellationToken::new(),
        };
        (claim_loop, receiver)
    }

    async fn append(store: &MemoryEntryStore, count: usize) {
        for _ in 0..count {
            store
                .append(NewEntry::new(Payload::new("t", b"{}".to_vec()), NodeId::new("a")))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn full_queue_skips_claim_cycle() {
        let store = Arc::new(MemoryEntryStore::new());
        append(&store, 3).await;
        let stats = Arc::new(RwLock::new(DispatchStats::default()));
        let (mut claim_loop, _receiver) = claim_loop(store.clone(), stats.clone());

        assert!(claim_loop.cycle().await);
        assert!(!claim_loop.cycle().await);

        let stats = stats.read().await;
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.skipped_claim_cycles, 1);
        assert_eq!(store.count_by_state(EntryState::Available).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_claim_cycle_is_counted_and_next_cycle_claims() {
        let store = Arc::new(MemoryEntryStore::new());
        append(&store, 1).await;
        let stats = Arc::new(RwLock::new(DispatchStats::default()));
        let (mut claim_loop, mut receiver) = claim_loop(store.clone(), stats.clone());

        store.fail_next(1);
        assert!(!claim_loop.cycle().await);
        assert_eq!(stats.read().await.store_errors, 1);
        assert_eq!(stats.read().await.claimed, 0);

        assert!(!claim_loop.cycle().await);
        assert_eq!(stats.read().await.claimed, 1);
        assert_eq!(receiver.try_recv().unwrap().state, EntryState::InProcessing);
    }
}
