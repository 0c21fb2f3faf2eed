//! Commit notification delivery under concurrent fires.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

use spool_core::{
    CommitNotifier, EntryId, EntryStore, MemoryEntryStore, NewEntry, NodeId, Payload,
    TransactionEvent,
};

const FIRES: usize = 50;

/// Countdown that reaches zero once every expected notification arrived.
struct Countdown {
    remaining: AtomicUsize,
}

impl Countdown {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Self { remaining: AtomicUsize::new(count) })
    }

    fn tick(&self) {
        self.remaining.fetch_sub(1, Ordering::SeqCst);
    }

    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[test]
fn concurrent_commits_reach_every_callback() {
    let notifier = CommitNotifier::new();
    let first = Countdown::new(FIRES);
    let second = Countdown::new(FIRES);

    let c = first.clone();
    notifier.on_commit(move |_| c.tick());
    let c = second.clone();
    notifier.on_commit(move |_| c.tick());

    let barrier = Arc::new(Barrier::new(FIRES));
    let threads: Vec<_> = (0..FIRES)
        .map(|i| {
            let notifier = notifier.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                notifier.fire(&TransactionEvent::committed(
                    NodeId::new(format!("node-{i}")),
                    vec![EntryId(i as i64)],
                ));
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    assert_eq!(first.remaining(), 0);
    assert_eq!(second.remaining(), 0);
}

#[tokio::test]
async fn concurrent_commits_reach_every_subscription() {
    let notifier = CommitNotifier::new();
    let mut first = notifier.subscribe();
    let mut second = notifier.subscribe();

    let barrier = Arc::new(Barrier::new(FIRES));
    let threads: Vec<_> = (0..FIRES)
        .map(|i| {
            let notifier = notifier.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                notifier.fire(&TransactionEvent::committed(
                    NodeId::new("node-a"),
                    vec![EntryId(i as i64)],
                ));
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let mut seen: Vec<i64> = first.drain().iter().map(|e| e.entry_ids[0].0).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..FIRES as i64).collect::<Vec<_>>());
    assert_eq!(second.drain().len(), FIRES);
}

#[tokio::test]
async fn store_append_fires_commit_for_the_new_entry() {
    let notifier = CommitNotifier::new();
    let mut subscription = notifier.subscribe();
    let store = MemoryEntryStore::new().with_notifier(notifier);
    let node = NodeId::new("node-a");

    let entry = store
        .append(NewEntry::new(Payload::new("order.created", b"{}".to_vec()), node.clone()))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.entry_ids, vec![entry.id]);
    assert_eq!(event.owner, node);
}

#[test]
fn callbacks_registered_during_fire_do_not_deadlock() {
    let notifier = CommitNotifier::new();
    let late = Countdown::new(1);

    let inner = notifier.clone();
    let l = late.clone();
    notifier.on_commit(move |_| {
        let l = l.clone();
        inner.on_commit(move |_| l.tick());
    });

    notifier.fire(&TransactionEvent::committed(NodeId::new("a"), vec![]));
    assert_eq!(late.remaining(), 1);

    notifier.fire(&TransactionEvent::committed(NodeId::new("a"), vec![]));
    assert_eq!(late.remaining(), 0);
}
