//! End-to-end bus scenarios over the in-memory store.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use spool_core::{EntryState, EntryStore, MemoryEntryStore, NodeId, SearchKeys};
use spool_dispatch::{
    BackoffStrategy, DispatchConfig, DispatchContext, Dispatcher, EventHandler, HandlerError,
    HandlerRegistry, PersistentQueueMode, RetryPolicy,
};
use spool_lock::{GlobalLocker, LocalLocker};
use spool_testing::{
    wait_for_state, wait_until, AlwaysFailingHandler, Invariants, RecordingHandler,
    ScriptedHandler, TestEvent,
};

const WAIT: Duration = Duration::from_secs(5);

fn bus_config(max_failure_retries: u32) -> DispatchConfig {
    DispatchConfig {
        mode: PersistentQueueMode::Polling,
        max_entries_claimed: 5,
        event_queue_capacity: 10,
        max_dispatch_threads: 4,
        polling_sleep_time: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        retry_policy: RetryPolicy {
            max_failure_retries,
            base_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        },
        ..DispatchConfig::default()
    }
}

#[tokio::test]
async fn retried_entry_waits_out_every_backoff() -> Result<()> {
    let store = Arc::new(MemoryEntryStore::new());
    let handler = ScriptedHandler::fail_times(2);
    let registry = HandlerRegistry::new().with_handler::<TestEvent, _>(handler.clone());
    let config = DispatchConfig { max_dispatch_threads: 1, ..bus_config(5) };
    let mut dispatcher = Dispatcher::new(NodeId::new("node-a"), store.clone(), registry, config)?;
    dispatcher.start().await?;

    let id = dispatcher.post(&TestEvent::new("invoice"), SearchKeys::key1("acct-1")).await?;
    wait_for_state(store.as_ref(), id, EntryState::Processed, WAIT).await?;
    dispatcher.shutdown().await?;

    let entry = store.find_by_id(id).await?.context("entry vanished")?;

    assert_eq!(entry.error_count, 2);
    let attempts = handler.attempts(id);
    assert_eq!(attempts.len(), 3);
    let first = attempts.first().context("no attempts")?.at;
    let last = attempts.last().context("no attempts")?.at;
    assert!(last.duration_since(first) >= Duration::from_millis(90));
    Ok(())
}

#[tokio::test]
async fn single_retry_limit_fails_and_stays_failed() -> Result<()> {
    let store = Arc::new(MemoryEntryStore::new());
    let handler = AlwaysFailingHandler::new();
    let registry = HandlerRegistry::new().with_handler::<TestEvent, _>(handler.clone());
    let mut dispatcher =
        Dispatcher::new(NodeId::new("node-a"), store.clone(), registry, bus_config(1))?;
    dispatcher.start().await?;

    let id = dispatcher.post(&TestEvent::new("doomed"), SearchKeys::default()).await?;
    wait_for_state(store.as_ref(), id, EntryState::Failed, WAIT).await?;
    let entry = store.find_by_id(id).await?.context("entry vanished")?;
    assert_eq!(entry.error_count, 1);
    assert_eq!(entry.processing_owner, None);

    assert_eq!(dispatcher.reap_once().await?, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.shutdown().await?;

    assert_eq!(handler.calls(), 1);
    let after = store.find_by_id(id).await?.context("entry vanished")?;
    assert_eq!(after.state, EntryState::Failed);
    Ok(())
}

#[derive(Clone, Default)]
struct ExclusiveHandler {
    locker: LocalLocker,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler<TestEvent> for ExclusiveHandler {
    async fn handle(&self, event: TestEvent, _ctx: &DispatchContext) -> Result<(), HandlerError> {
        let lock = self
            .locker
            .lock("ledger", &event.body, Duration::from_secs(2))
            .await?
            .context("ledger lock timed out")?;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        lock.release().await?;
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_sharing_a_key_run_one_at_a_time() -> Result<()> {
    let store = Arc::new(MemoryEntryStore::new());
    let handler = ExclusiveHandler::default();
    let registry = HandlerRegistry::new().with_handler::<TestEvent, _>(handler.clone());
    let mut dispatcher =
        Dispatcher::new(NodeId::new("node-a"), store.clone(), registry, bus_config(3))?;
    dispatcher.start().await?;

    for _ in 0..12 {
        dispatcher.post(&TestEvent::new("account-7"), SearchKeys::default()).await?;
    }
    wait_until(WAIT, || async { handler.done.load(Ordering::SeqCst) == 12 }).await?;
    dispatcher.shutdown().await?;

    assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    assert_eq!(store.count_by_state(EntryState::Processed).await?, 12);
    Ok(())
}

#[tokio::test]
async fn processed_entries_move_to_history_on_purge() -> Result<()> {
    let store = Arc::new(MemoryEntryStore::new());
    let handler = RecordingHandler::new();
    let registry = HandlerRegistry::new().with_handler::<TestEvent, _>(handler.clone());
    let mut dispatcher =
        Dispatcher::new(NodeId::new("node-a"), store.clone(), registry, bus_config(3))?;
    dispatcher.start().await?;

    for i in 0..6 {
        dispatcher.post(&TestEvent::new(format!("e{i}")), SearchKeys::pair("batch", "7")).await?;
    }
    wait_until(WAIT, || async { handler.count() == 6 }).await?;
    dispatcher.shutdown().await?;
    wait_until(WAIT, || async {
        store.count_by_state(EntryState::Processed).await.unwrap_or(0) == 6
    })
    .await?;

    let moved = store.purge(Utc::now() + chrono::Duration::seconds(1)).await?;
    assert_eq!(moved, 6);
    assert_eq!(store.history_len().await, 6);
    assert_eq!(store.count_by_state(EntryState::Processed).await?, 0);
    assert!(store.find_by_search_keys(Some("batch"), Some("7")).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_drain_a_shared_store_exactly_once() -> Result<()> {
    let store = Arc::new(MemoryEntryStore::new());
    let handler = RecordingHandler::new();

    let mut nodes = Vec::new();
    for name in ["node-a", "node-b"] {
        let registry = HandlerRegistry::new().with_handler::<TestEvent, _>(handler.clone());
        let mut dispatcher =
            Dispatcher::new(NodeId::new(name), store.clone(), registry, bus_config(3))?;
        dispatcher.start().await?;
        nodes.push(dispatcher);
    }

    for i in 0..40 {
        let node = &nodes[i % nodes.len()];
        node.post(&TestEvent::new(format!("e{i}")), SearchKeys::default()).await?;
    }
    wait_until(WAIT, || async { handler.count() == 40 }).await?;
    for node in nodes {
        node.shutdown().await?;
    }

    let mut ids = handler.entry_ids();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 40);

    let entries = store.entries().await;
    Invariants::all_terminal(&entries)?;
    Invariants::ownership_consistent(&entries)?;
    Ok(())
}
