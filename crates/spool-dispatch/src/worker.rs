//! Dispatch workers.
//!
//! Workers share one receiver of the internal queue. Each takes an entry,
//! dispatches it to completion and persists the resolution before taking
//! the next, so an entry is never abandoned mid-handler by cancellation.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use spool_core::{CoreError, Entry, EntryState, EntryStore};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    callback::{DispatchCallback, DispatchOutcome},
    dispatcher::DispatchStats,
    error::{DispatchError, ErrorCategory},
};

/// Shared receiving end of the internal queue.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Entry>>>;

/// Counts an entry as in flight until dropped, including when the worker
/// task is aborted mid-handler.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches one claimed entry and writes its resolution back.
pub(crate) struct EntryProcessor {
    store: Arc<dyn EntryStore>,
    callback: DispatchCallback,
    stats: Arc<RwLock<DispatchStats>>,
    in_flight: AtomicU64,
}

impl EntryProcessor {
    pub(crate) fn new(
        store: Arc<dyn EntryStore>,
        callback: DispatchCallback,
        stats: Arc<RwLock<DispatchStats>>,
    ) -> Self {
        Self { store, callback, stats, in_flight: AtomicU64::new(0) }
    }

    /// Entries currently between claim hand-off and persisted resolution.
    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) async fn process(&self, entry: Entry) {
        let _in_flight = InFlight::enter(&self.in_flight);

        let outcome = self.callback.dispatch(&entry).await;
        let next = self.callback.build_entry(&entry, &outcome);

        match self.store.update(&entry, &next).await {
            Ok(()) => self.record(&entry, &next, &outcome).await,
            Err(CoreError::ConcurrentModification { id }) => {
                debug!(entry_id = %id, "entry resolved elsewhere, dropping outcome");
                self.stats.write().await.lost_races += 1;
            },
            Err(error) => {
                let error = DispatchError::from(error);
                warn!(
                    entry_id = %entry.id,
                    category = %ErrorCategory::from(&error),
                    retryable = error.is_retryable(),
                    error = %error,
                    "failed to persist dispatch outcome, entry will be reaped"
                );
                self.stats.write().await.store_errors += 1;
            },
        }
    }

    async fn record(&self, claimed: &Entry, next: &Entry, outcome: &DispatchOutcome) {
        let event_type = claimed.payload.event_type.as_str();
        match (next.state, outcome) {
            (EntryState::Processed, _) => {
                debug!(entry_id = %claimed.id, event_type, "entry processed");
                self.stats.write().await.processed += 1;
            },
            (EntryState::Available, DispatchOutcome::HandlerFailed { error }) => {
                info!(
                    entry_id = %claimed.id,
                    event_type,
                    error_count = next.error_count,
                    next_available_time = %next.next_available_time,
                    error = %error,
                    "handler failed, retry scheduled"
                );
                self.stats.write().await.retried += 1;
            },
            (EntryState::Failed, DispatchOutcome::Undecodable { reason }) => {
                warn!(entry_id = %claimed.id, event_type, reason = %reason, "undecodable entry failed");
                self.stats.write().await.failed += 1;
            },
            (EntryState::Failed, _) => {
                warn!(
                    entry_id = %claimed.id,
                    event_type,
                    error_count = next.error_count,
                    "entry exhausted its retries"
                );
                self.stats.write().await.failed += 1;
            },
            (state, _) => debug!(entry_id = %claimed.id, %state, "entry resolved"),
        }
    }
}

/// One worker task draining the shared queue.
pub(crate) struct Worker {
    id: usize,
    receiver: SharedReceiver,
    processor: Arc<EntryProcessor>,
    cancellation_token: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        receiver: SharedReceiver,
        processor: Arc<EntryProcessor>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, receiver, processor, cancellation_token }
    }

    /// Runs until cancellation or until the queue closes.
    pub(crate) async fn run(self) {
        debug!(worker_id = self.id, "worker loop starting");

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => None,
                entry = async { self.receiver.lock().await.recv().await } => entry,
            };

            let Some(entry) = next else {
                break;
            };
            debug!(worker_id = self.id, entry_id = %entry.id, "dispatching entry");
            self.processor.process(entry).await;
        }

        debug!(worker_id = self.id, "worker loop stopped");
    }
}
