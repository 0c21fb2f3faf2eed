//! Supervised pool of dispatch workers.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::RwLock,
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::DispatchStats,
    error::{DispatchError, Result},
    worker::{EntryProcessor, SharedReceiver, Worker},
};

/// Fixed-size pool of workers draining one internal queue.
pub(crate) struct WorkerPool {
    worker_count: usize,
    receiver: SharedReceiver,
    processor: Arc<EntryProcessor>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(
        worker_count: usize,
        receiver: SharedReceiver,
        processor: Arc<EntryProcessor>,
        stats: Arc<RwLock<DispatchStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count,
            receiver,
            processor,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns every worker and returns immediately.
    pub(crate) async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning dispatch workers");
        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = Worker::new(
                worker_id,
                self.receiver.clone(),
                self.processor.clone(),
                self.cancellation_token.clone(),
            );
            self.worker_handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Cancels the workers and waits up to `timeout` for in-flight entries.
    ///
    /// Workers still running at the deadline are aborted.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if the deadline passed.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "stopping dispatch workers"
        );
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let abort_handles: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();

        let join_all = async {
            let mut panicked = 0_usize;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    let error = DispatchError::WorkerPanic { worker_id, error: join_error.to_string() };
                    error!(error = %error, "dispatch worker terminated abnormally");
                    panicked += 1;
                }
            }
            panicked
        };

        let result = match tokio::time::timeout(timeout, join_all).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some dispatch workers terminated abnormally");
                }
                info!("dispatch workers stopped");
                Ok(())
            },
            Err(_elapsed) => {
                let still_running = abort_handles.iter().filter(|h| !h.is_finished()).count();
                error!(still_running, "dispatch workers missed the shutdown deadline, aborting");
                for handle in &abort_handles {
                    handle.abort();
                }
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        };

        self.stats.write().await.active_workers = 0;
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(active_workers = active, "worker pool dropped while running, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}
