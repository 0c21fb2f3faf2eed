//! Cross-process locker over a coordination service.
//!
//! Acquisition follows the sequential ephemeral node recipe. Each contender
//! creates `/{service}/{key}/lock-NNNNNNNNNN`; the lowest sequence number
//! holds the lock and every other contender watches the node just below its
//! own. Progress is an explicit [`LockState`] machine advanced by
//! [`LockSignal`]s, which arrive from watches and session notifications on
//! one channel per acquisition.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    coordination::{CoordinationClient, SessionEvent},
    error::{lock_dir, LockError, Result},
    GlobalLock, GlobalLocker, LockHandle,
};

const NODE_PREFIX: &str = "lock-";

/// Progress of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock node exists for this contender.
    Unlocked,
    /// Lock node created; a lower node still exists.
    Waiting {
        /// Full path of this contender's node
        node: String,
    },
    /// This contender's node is the lowest.
    Held {
        /// Full path of this contender's node
        node: String,
    },
}

/// Input driving [`LockState`] transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockSignal {
    /// The contender's node was created.
    Created {
        /// Full path of the new node
        node: String,
    },
    /// The contender's node is now the lowest.
    Acquired,
    /// The watched predecessor disappeared.
    PredecessorDeleted,
    /// The connection dropped.
    SessionLost,
    /// The connection came back within the session.
    SessionRestored,
    /// The session expired and took the contender's node with it.
    SessionExpired,
    /// The acquisition deadline passed.
    TimedOut,
}

impl LockState {
    /// Applies `signal`, returning the next state.
    ///
    /// Connection loss keeps a waiter waiting; expiry drops the node so the
    /// contender starts over from `Unlocked`.
    pub fn on_signal(self, signal: &LockSignal) -> Self {
        match (self, signal) {
            (Self::Unlocked, LockSignal::Created { node }) => Self::Waiting { node: node.clone() },
            (Self::Waiting { node }, LockSignal::Acquired) => Self::Held { node },
            (_, LockSignal::SessionExpired | LockSignal::TimedOut) => Self::Unlocked,
            (state, _) => state,
        }
    }
}

/// Locker backed by a [`CoordinationClient`].
#[derive(Debug)]
pub struct CoordinatedLocker<C> {
    client: Arc<C>,
}

impl<C> Clone for CoordinatedLocker<C> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone() }
    }
}

impl<C: CoordinationClient> CoordinatedLocker<C> {
    /// Creates a locker using `client`.
    pub fn new(client: C) -> Self {
        Self { client: Arc::new(client) }
    }

    /// Underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: CoordinationClient> GlobalLocker for CoordinatedLocker<C> {
    async fn is_free(&self, service: &str, key: &str) -> Result<bool> {
        let dir = lock_dir(service, key)?;
        Ok(self.client.children(&dir).await?.is_empty())
    }

    async fn lock(&self, service: &str, key: &str, timeout: Duration) -> Result<Option<GlobalLock>> {
        let dir = lock_dir(service, key)?;
        let mut acquisition = Acquisition::new(self.client.clone(), dir, timeout);
        let outcome = acquisition.run().await;
        acquisition.stop_forwarders();

        match outcome? {
            Some(node) => {
                let handle = CoordinatedHandle { client: self.client.clone(), node };
                Ok(Some(GlobalLock::new(service, key, Arc::new(handle))))
            },
            None => Ok(None),
        }
    }
}

/// State of one `lock` call.
struct Acquisition<C> {
    client: Arc<C>,
    dir: String,
    deadline: Instant,
    state: LockState,
    stale_node: Option<String>,
    signals: mpsc::UnboundedReceiver<LockSignal>,
    sender: mpsc::UnboundedSender<LockSignal>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<C: CoordinationClient> Acquisition<C> {
    fn new(client: Arc<C>, dir: String, timeout: Duration) -> Self {
        let (sender, signals) = mpsc::unbounded_channel();
        let mut acquisition = Self {
            client,
            dir,
            deadline: Instant::now() + timeout,
            state: LockState::Unlocked,
            stale_node: None,
            signals,
            sender,
            forwarders: Vec::new(),
        };
        acquisition.forward_session_events();
        acquisition
    }

    fn forward_session_events(&mut self) {
        let mut events = self.client.session_events();
        let sender = self.sender.clone();
        self.forwarders.push(tokio::spawn(async move {
            loop {
                let signal = match events.recv().await {
                    Ok(SessionEvent::Disconnected) => LockSignal::SessionLost,
                    Ok(SessionEvent::Reconnected) => LockSignal::SessionRestored,
                    Ok(SessionEvent::Expired) => LockSignal::SessionExpired,
                    Err(broadcast::error::RecvError::Lagged(_)) => LockSignal::SessionRestored,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if sender.send(signal).is_err() {
                    return;
                }
            }
        }));
    }

    fn forward_deletion(&mut self, watch: tokio::sync::oneshot::Receiver<()>) {
        let sender = self.sender.clone();
        self.forwarders.push(tokio::spawn(async move {
            if watch.await.is_ok() {
                let _ = sender.send(LockSignal::PredecessorDeleted);
            }
        }));
    }

    fn stop_forwarders(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }

    fn apply(&mut self, signal: &LockSignal) {
        let previous = std::mem::replace(&mut self.state, LockState::Unlocked);
        let previous_node = match &previous {
            LockState::Waiting { node } | LockState::Held { node } => Some(node.clone()),
            LockState::Unlocked => None,
        };
        self.state = previous.on_signal(signal);
        if self.state == LockState::Unlocked {
            if let Some(node) = previous_node {
                self.stale_node = Some(node);
            }
        }
        debug!(dir = %self.dir, ?signal, state = ?self.state, "lock state advanced");
    }

    /// Drives the state machine to `Held` (returning the node) or to a
    /// timeout (returning `None`).
    async fn run(&mut self) -> Result<Option<String>> {
        loop {
            match self.state.clone() {
                LockState::Unlocked => {
                    self.discard_stale_node().await;
                    match self.create_node().await {
                        Ok(node) => self.apply(&LockSignal::Created { node }),
                        Err(LockError::ConnectionLoss) => {
                            if !self.await_signal().await {
                                return Ok(None);
                            }
                        },
                        Err(error) => return Err(error),
                    }
                },
                LockState::Waiting { node } => match self.check_position(&node).await {
                    Ok(Position::Lowest) => self.apply(&LockSignal::Acquired),
                    Ok(Position::Vanished) => self.apply(&LockSignal::SessionExpired),
                    Ok(Position::Behind) | Err(LockError::ConnectionLoss) => {
                        if !self.await_signal().await {
                            self.discard_stale_node().await;
                            return Ok(None);
                        }
                    },
                    Err(error) => {
                        self.abandon(&node).await;
                        return Err(error);
                    },
                },
                LockState::Held { node } => {
                    info!(%node, "coordinated lock acquired");
                    return Ok(Some(node));
                },
            }
        }
    }

    async fn create_node(&self) -> Result<String> {
        self.client.create_sequential_ephemeral(&format!("{}/{NODE_PREFIX}", self.dir)).await
    }

    /// Locates `node` among the contenders. When another node is ahead,
    /// arranges a signal for when that may change.
    async fn check_position(&mut self, node: &str) -> Result<Position> {
        let children = self.client.children(&self.dir).await?;
        let own = node.rsplit('/').next().unwrap_or(node);

        let Some(position) = children.iter().position(|child| child == own) else {
            return Ok(Position::Vanished);
        };
        if position == 0 {
            return Ok(Position::Lowest);
        }

        let predecessor = format!("{}/{}", self.dir, children[position - 1]);
        match self.client.watch_deletion(&predecessor).await? {
            Some(watch) => self.forward_deletion(watch),
            None => {
                let _ = self.sender.send(LockSignal::PredecessorDeleted);
            },
        }
        debug!(%node, %predecessor, "waiting for predecessor");
        Ok(Position::Behind)
    }

    /// Waits for a signal that can change the outcome of the next check.
    /// Returns `false` once the deadline passes.
    async fn await_signal(&mut self) -> bool {
        let deadline = self.deadline;
        loop {
            let signal = tokio::select! {
                signal = self.signals.recv() => signal,
                () = tokio::time::sleep_until(deadline) => Some(LockSignal::TimedOut),
            };
            let Some(signal) = signal else {
                return false;
            };

            self.apply(&signal);
            match signal {
                LockSignal::TimedOut => return false,
                LockSignal::SessionLost => {},
                _ => return true,
            }
        }
    }

    /// Deletes the node left behind by a transition back to `Unlocked`.
    /// A node already removed by session expiry is not an error.
    async fn discard_stale_node(&mut self) {
        if let Some(node) = self.stale_node.take() {
            self.abandon(&node).await;
        }
    }

    async fn abandon(&self, node: &str) {
        match self.client.delete(node).await {
            Ok(existed) => debug!(%node, existed, "abandoned lock node"),
            Err(error) => warn!(%node, error = %error, "failed to delete abandoned lock node"),
        }
    }
}

/// Where a contender's node sits among the lock's children.
enum Position {
    Lowest,
    Behind,
    Vanished,
}

struct CoordinatedHandle<C> {
    client: Arc<C>,
    node: String,
}

#[async_trait]
impl<C: CoordinationClient> LockHandle for CoordinatedHandle<C> {
    async fn release(&self) -> Result<()> {
        if self.client.delete(&self.node).await? {
            debug!(node = %self.node, "coordinated lock released");
            Ok(())
        } else {
            Err(LockError::SessionExpired { path: self.node.clone() })
        }
    }

    fn release_detached(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(node = %self.node, "no runtime to release dropped lock, node remains until session expiry");
            return;
        };
        let client = self.client.clone();
        let node = self.node.clone();
        runtime.spawn(async move {
            if let Err(error) = client.delete(&node).await {
                warn!(%node, error = %error, "failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u32) -> String {
        format!("/svc/k/lock-{n:010}")
    }

    #[test]
    fn waiting_survives_disconnect_and_restarts_on_expiry() {
        let state = LockState::Unlocked.on_signal(&LockSignal::Created { node: node(3) });
        assert_eq!(state, LockState::Waiting { node: node(3) });

        let state = state.on_signal(&LockSignal::SessionLost);
        let state = state.on_signal(&LockSignal::SessionRestored);
        assert_eq!(state, LockState::Waiting { node: node(3) });

        let state = state.on_signal(&LockSignal::SessionExpired);
        assert_eq!(state, LockState::Unlocked);
    }

    #[test]
    fn acquired_only_from_waiting() {
        assert_eq!(LockState::Unlocked.on_signal(&LockSignal::Acquired), LockState::Unlocked);
        assert_eq!(
            LockState::Waiting { node: node(1) }.on_signal(&LockSignal::Acquired),
            LockState::Held { node: node(1) }
        );
        assert_eq!(
            LockState::Held { node: node(1) }.on_signal(&LockSignal::PredecessorDeleted),
            LockState::Held { node: node(1) }
        );
    }

    #[test]
    fn timeout_resets_to_unlocked() {
        assert_eq!(
            LockState::Waiting { node: node(2) }.on_signal(&LockSignal::TimedOut),
            LockState::Unlocked
        );
    }
}
