//! Mode-aware claiming and reaping.

use std::sync::Arc;

use spool_core::{Entry, EntryState, EntryStore, NodeId, ReapPolicy};
use tracing::{debug, info, warn};

use crate::{config::PersistentQueueMode, error::Result};

/// Bridges the dispatcher's demand for work to the store.
///
/// Sticky modes restrict claims to entries this node created; `Polling`
/// claims any node's entries.
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn EntryStore>,
    node_id: NodeId,
    mode: PersistentQueueMode,
    reap_policy: ReapPolicy,
}

impl ClaimManager {
    /// Creates a claim manager acting for `node_id`.
    pub fn new(
        store: Arc<dyn EntryStore>,
        node_id: NodeId,
        mode: PersistentQueueMode,
        reap_policy: ReapPolicy,
    ) -> Self {
        Self { store, node_id, mode, reap_policy }
    }

    /// Node on whose behalf entries are claimed.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Active queue mode.
    pub fn mode(&self) -> PersistentQueueMode {
        self.mode
    }

    /// Creator restriction applied to claims, if any.
    pub fn owner_filter(&self) -> Option<&NodeId> {
        self.mode.is_sticky().then_some(&self.node_id)
    }

    /// Claims up to `max` due entries for this node.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::StoreUnavailable` if the store call fails.
    pub async fn claim(&self, max: usize) -> Result<Vec<Entry>> {
        let entries = self.store.claim_batch(max, &self.node_id, self.owner_filter()).await?;
        if !entries.is_empty() {
            debug!(
                node_id = %self.node_id,
                mode = %self.mode,
                claimed = entries.len(),
                "claimed entries"
            );
        }
        Ok(entries)
    }

    /// Returns orphaned claims of any node to circulation.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::StoreUnavailable` if the store call fails.
    pub async fn reap(&self) -> Result<Vec<Entry>> {
        let reaped = self.store.reap_stale(self.reap_policy).await?;
        if reaped.is_empty() {
            return Ok(reaped);
        }

        let exhausted = reaped.iter().filter(|e| e.state == EntryState::Reaped).count();
        info!(
            node_id = %self.node_id,
            reaped = reaped.len(),
            exhausted,
            "reaped stale claims"
        );
        for entry in reaped.iter().filter(|e| e.state == EntryState::Reaped) {
            warn!(
                entry_id = %entry.id,
                error_count = entry.error_count,
                event_type = %entry.payload.event_type,
                "entry exhausted its retries while orphaned"
            );
        }
        Ok(reaped)
    }
}

impl std::fmt::Debug for ClaimManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimManager")
            .field("engine", &self.store.engine_kind())
            .field("node_id", &self.node_id)
            .field("mode", &self.mode)
            .field("reap_policy", &self.reap_policy)
            .finish()
    }
}
