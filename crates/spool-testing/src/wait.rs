//! Polling helpers for asynchronous assertions.

use std::{future::Future, time::Duration};

use anyhow::{bail, Result};
use spool_core::{EntryId, EntryState, EntryStore};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds or `timeout` passes.
///
/// # Errors
///
/// Returns error if the condition still fails at the deadline.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until entry `id` reaches `state`.
///
/// # Errors
///
/// Returns error on store failure or if the state is not reached in time.
pub async fn wait_for_state(
    store: &dyn EntryStore,
    id: EntryId,
    state: EntryState,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = store.find_by_id(id).await?.map(|e| e.state);
        if current == Some(state) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("entry {id} is {current:?}, expected {state} within {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
