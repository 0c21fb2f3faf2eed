//! Commit notification fired by storage backends after a local transaction
//! ends.
//!
//! Registered callbacks live in an immutable snapshot that is swapped as a
//! whole on registration, so [`CommitNotifier::fire`] never holds a lock
//! while invoking them. Each [`NotificationSubscription`] owns its own
//! unbounded queue: every fired commit is enqueued for every subscriber, and
//! concurrent fires from many threads cannot collapse into a single wake-up.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::models::{EntryId, NodeId};

/// How a local transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// The transaction committed.
    Commit,
    /// The transaction rolled back.
    Rollback,
}

/// Notification describing one finished transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    /// Commit or rollback.
    pub outcome: TransactionOutcome,
    /// Entries written by the transaction.
    pub entry_ids: Vec<EntryId>,
    /// Node that ran the transaction.
    pub owner: NodeId,
}

impl TransactionEvent {
    /// A committed transaction that wrote `entry_ids`.
    pub fn committed(owner: NodeId, entry_ids: Vec<EntryId>) -> Self {
        Self { outcome: TransactionOutcome::Commit, entry_ids, owner }
    }

    /// A rolled-back transaction.
    pub fn rolled_back(owner: NodeId, entry_ids: Vec<EntryId>) -> Self {
        Self { outcome: TransactionOutcome::Rollback, entry_ids, owner }
    }
}

type Callback = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    on_commit: RwLock<Arc<Vec<Callback>>>,
    on_rollback: RwLock<Arc<Vec<Callback>>>,
    subscribers: RwLock<Arc<Vec<mpsc::UnboundedSender<TransactionEvent>>>>,
}

/// Fan-out point for transaction completion signals.
///
/// Cheap to clone; clones share registrations.
#[derive(Clone, Default)]
pub struct CommitNotifier {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for CommitNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitNotifier")
            .field("commit_callbacks", &snapshot(&self.registry.on_commit).len())
            .field("rollback_callbacks", &snapshot(&self.registry.on_rollback).len())
            .field("subscribers", &snapshot(&self.registry.subscribers).len())
            .finish()
    }
}

impl CommitNotifier {
    /// Creates a notifier with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked synchronously on every commit.
    pub fn on_commit<F>(&self, callback: F)
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        append(&self.registry.on_commit, callback);
    }

    /// Registers a callback invoked synchronously on every rollback.
    pub fn on_rollback<F>(&self, callback: F)
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        append(&self.registry.on_rollback, callback);
    }

    /// Opens a queue receiving every commit fired from now on.
    ///
    /// Subscriptions whose receiver was dropped are pruned here.
    pub fn subscribe(&self) -> NotificationSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut guard = self.registry.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<_> = guard.iter().filter(|s| !s.is_closed()).cloned().collect();
        next.push(sender);
        *guard = Arc::new(next);

        NotificationSubscription { receiver }
    }

    /// Delivers `event` to the matching callbacks and, for commits, to every
    /// subscription. Safe to call from any thread concurrently.
    pub fn fire(&self, event: &TransactionEvent) {
        let callbacks = match event.outcome {
            TransactionOutcome::Commit => snapshot(&self.registry.on_commit),
            TransactionOutcome::Rollback => snapshot(&self.registry.on_rollback),
        };
        for callback in callbacks.iter() {
            callback(event);
        }

        if event.outcome == TransactionOutcome::Commit {
            for subscriber in snapshot(&self.registry.subscribers).iter() {
                // A closed receiver only means the subscriber went away.
                let _ = subscriber.send(event.clone());
            }
        }
    }
}

fn snapshot<T>(slot: &RwLock<Arc<Vec<T>>>) -> Arc<Vec<T>> {
    Arc::clone(&slot.read().unwrap_or_else(PoisonError::into_inner))
}

fn append<T: Clone>(slot: &RwLock<Arc<Vec<T>>>, item: T) {
    let mut guard = slot.write().unwrap_or_else(PoisonError::into_inner);
    let mut next = Vec::with_capacity(guard.len() + 1);
    next.extend(guard.iter().cloned());
    next.push(item);
    *guard = Arc::new(next);
}

/// Receiving end of [`CommitNotifier::subscribe`].
#[derive(Debug)]
pub struct NotificationSubscription {
    receiver: mpsc::UnboundedReceiver<TransactionEvent>,
}

impl NotificationSubscription {
    /// Waits for the next commit. Returns `None` once the notifier is gone.
    pub async fn recv(&mut self) -> Option<TransactionEvent> {
        self.receiver.recv().await
    }

    /// Takes every commit already queued without waiting.
    pub fn drain(&mut self) -> Vec<TransactionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
