//! Global locks for serializing handler work on a shared resource.
//!
//! The dispatch engine gives no ordering guarantee across nodes. Handlers
//! that must not run concurrently for the same logical resource take a
//! [`GlobalLock`] named by a service and a key:
//!
//! - [`LocalLocker`] serializes within one process.
//! - [`CoordinatedLocker`] serializes across processes through a
//!   coordination service using sequential ephemeral nodes: the lowest
//!   sequence number holds the lock and every waiter watches its
//!   predecessor.
//!
//! [`MemoryCoordinator`] is an in-process coordination service with session
//! loss simulation for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::warn;

pub mod coordinated;
pub mod coordination;
pub mod error;
pub mod local;

pub use coordinated::{CoordinatedLocker, LockSignal, LockState};
pub use coordination::{CoordinationClient, MemoryCoordinator, MemorySession, SessionEvent};
pub use error::{LockError, Result};
pub use local::LocalLocker;

/// Lock provider keyed by service and key.
#[async_trait]
pub trait GlobalLocker: Send + Sync {
    /// Whether nobody currently holds or waits for the lock.
    async fn is_free(&self, service: &str, key: &str) -> Result<bool>;

    /// Acquires the lock, waiting at most `timeout`.
    ///
    /// Returns `None` if the lock could not be acquired in time.
    async fn lock(&self, service: &str, key: &str, timeout: Duration) -> Result<Option<GlobalLock>>;
}

/// Backend-specific release of a held lock.
#[async_trait]
pub(crate) trait LockHandle: Send + Sync {
    async fn release(&self) -> Result<()>;

    /// Best-effort release used when a lock is dropped unreleased.
    fn release_detached(&self);
}

/// A held lock. Release it explicitly; dropping it releases in the
/// background.
pub struct GlobalLock {
    service: String,
    key: String,
    handle: Arc<dyn LockHandle>,
    released: bool,
}

impl GlobalLock {
    pub(crate) fn new(service: &str, key: &str, handle: Arc<dyn LockHandle>) -> Self {
        Self { service: service.to_string(), key: key.to_string(), handle, released: false }
    }

    /// Service the lock belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Key within the service.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock and wakes the next waiter.
    ///
    /// # Errors
    ///
    /// Returns `LockError::SessionExpired` if the lock was already lost to
    /// a session expiry.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.handle.release().await
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        if !self.released {
            warn!(service = %self.service, key = %self.key, "lock dropped without release");
            self.handle.release_detached();
        }
    }
}

impl std::fmt::Debug for GlobalLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLock")
            .field("service", &self.service)
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}
