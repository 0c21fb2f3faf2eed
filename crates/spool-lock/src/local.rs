//! Process-local locker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    error::{lock_dir, Result},
    GlobalLock, GlobalLocker, LockHandle,
};

#[derive(Debug)]
struct Slot {
    held: bool,
    notify: Arc<Notify>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

fn guard(slots: &Mutex<HashMap<String, Slot>>) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Locker serializing holders within this process.
///
/// Waiters park on a per-key [`Notify`] and are woken one at a time on
/// release.
#[derive(Debug, Clone, Default)]
pub struct LocalLocker {
    slots: Slots,
}

impl LocalLocker {
    /// Creates a locker with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, path: &str) -> std::result::Result<(), Arc<Notify>> {
        let mut slots = guard(&self.slots);
        let slot = slots
            .entry(path.to_string())
            .or_insert_with(|| Slot { held: false, notify: Arc::new(Notify::new()) });
        if slot.held {
            Err(slot.notify.clone())
        } else {
            slot.held = true;
            Ok(())
        }
    }

    fn is_held(&self, path: &str) -> bool {
        guard(&self.slots).get(path).is_some_and(|slot| slot.held)
    }
}

#[async_trait]
impl GlobalLocker for LocalLocker {
    async fn is_free(&self, service: &str, key: &str) -> Result<bool> {
        let path = lock_dir(service, key)?;
        Ok(!self.is_held(&path))
    }

    async fn lock(&self, service: &str, key: &str, timeout: Duration) -> Result<Option<GlobalLock>> {
        let path = lock_dir(service, key)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = match self.try_acquire(&path) {
                Ok(()) => {
                    debug!(%path, "local lock acquired");
                    let handle = LocalHandle { slots: self.slots.clone(), path };
                    return Ok(Some(GlobalLock::new(service, key, Arc::new(handle))));
                },
                Err(notify) => notify,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_held(&path) {
                continue;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(%path, "local lock wait timed out");
                return Ok(None);
            }
        }
    }
}

struct LocalHandle {
    slots: Slots,
    path: String,
}

impl LocalHandle {
    fn unlock(&self) {
        let mut slots = guard(&self.slots);
        let Some(slot) = slots.get_mut(&self.path) else {
            return;
        };
        slot.held = false;
        if Arc::strong_count(&slot.notify) == 1 {
            slots.remove(&self.path);
        } else {
            slot.notify.notify_one();
        }
    }
}

#[async_trait]
impl LockHandle for LocalHandle {
    async fn release(&self) -> Result<()> {
        self.unlock();
        Ok(())
    }

    fn release_detached(&self) {
        self.unlock();
    }
}
