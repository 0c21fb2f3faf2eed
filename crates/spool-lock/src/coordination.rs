//! Coordination service client and an in-memory implementation.
//!
//! The client exposes the small subset of a hierarchical coordination
//! service that lock recipes need: sequential ephemeral nodes, child
//! listing, one-shot deletion watches and session state notifications.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::error::{LockError, Result};

/// Change in the client's session with the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection dropped; ephemeral nodes survive until expiry.
    Disconnected,
    /// Connection re-established within the session timeout.
    Reconnected,
    /// Session expired; every ephemeral node it owned is gone.
    Expired,
}

/// Client of a hierarchical coordination service.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Creates an ephemeral node named `prefix` followed by a zero-padded
    /// sequence number unique within the parent, returning its full path.
    async fn create_sequential_ephemeral(&self, prefix: &str) -> Result<String>;

    /// Names of the children of `parent`, sorted. A missing parent has no
    /// children.
    async fn children(&self, parent: &str) -> Result<Vec<String>>;

    /// Watches `path` for deletion. Returns `None` if it does not exist.
    async fn watch_deletion(&self, path: &str) -> Result<Option<oneshot::Receiver<()>>>;

    /// Deletes `path`, returning whether it existed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Subscribes to session state changes.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, u64>,
    sequences: HashMap<String, u64>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    next_session: u64,
}

impl Tree {
    fn remove(&mut self, path: &str) -> bool {
        let existed = self.nodes.remove(path).is_some();
        for watch in self.watches.remove(path).unwrap_or_default() {
            let _ = watch.send(());
        }
        existed
    }

    fn new_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// In-process coordination service shared by every [`MemorySession`]
/// created from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryCoordinator {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session.
    pub fn session(&self) -> MemorySession {
        let id = lock_tree(&self.tree).new_session();
        let (events, _) = broadcast::channel(16);
        MemorySession {
            tree: self.tree.clone(),
            state: Arc::new(Mutex::new(SessionState { id, connected: true })),
            events,
        }
    }

    /// Number of nodes currently in the tree.
    pub fn node_count(&self) -> usize {
        lock_tree(&self.tree).nodes.len()
    }
}

fn lock_tree(tree: &Mutex<Tree>) -> MutexGuard<'_, Tree> {
    tree.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
struct SessionState {
    id: u64,
    connected: bool,
}

/// One client session against a [`MemoryCoordinator`].
///
/// `disconnect`, `reconnect` and `expire` simulate the session failures a
/// real service produces. After `expire` the session continues under a new
/// identity, as a client would after re-establishing its connection.
#[derive(Debug, Clone)]
pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    fn session_id(&self) -> Result<u64> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.connected {
            Ok(state.id)
        } else {
            Err(LockError::ConnectionLoss)
        }
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).connected = connected;
    }

    /// Drops the connection; operations fail with `ConnectionLoss`.
    pub fn disconnect(&self) {
        self.set_connected(false);
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    /// Restores the connection within the same session.
    pub fn reconnect(&self) {
        self.set_connected(true);
        let _ = self.events.send(SessionEvent::Reconnected);
    }

    /// Expires the session, deleting its ephemeral nodes.
    pub fn expire(&self) {
        {
            let mut tree = lock_tree(&self.tree);
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, session)| **session == state.id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                tree.remove(path);
            }
            debug!(session = state.id, removed = owned.len(), "session expired");
            state.id = tree.new_session();
            state.connected = true;
        }
        let _ = self.events.send(SessionEvent::Expired);
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn create_sequential_ephemeral(&self, prefix: &str) -> Result<String> {
        let session = self.session_id()?;
        let mut tree = lock_tree(&self.tree);
        let sequence = tree.sequences.entry(parent_of(prefix).to_string()).or_insert(0);
        let path = format!("{prefix}{:010}", *sequence);
        *sequence += 1;
        tree.nodes.insert(path.clone(), session);
        Ok(path)
    }

    async fn children(&self, parent: &str) -> Result<Vec<String>> {
        self.session_id()?;
        let tree = lock_tree(&self.tree);
        let prefix = format!("{parent}/");
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let name = &path[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    async fn watch_deletion(&self, path: &str) -> Result<Option<oneshot::Receiver<()>>> {
        self.session_id()?;
        let mut tree = lock_tree(&self.tree);
        if !tree.nodes.contains_key(path) {
            return Ok(None);
        }
        let (sender, receiver) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(sender);
        Ok(Some(receiver))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.session_id()?;
        Ok(lock_tree(&self.tree).remove(path))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
