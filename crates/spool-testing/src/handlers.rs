//! Handlers with scripted behavior.
//!
//! Every handler is cheap to clone and shares its record between clones, so
//! a test keeps one copy for assertions and registers the other.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use spool_core::EntryId;
use spool_dispatch::{DispatchContext, EventHandler, HandlerError};

use crate::fixtures::TestEvent;

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Entry that was dispatched.
    pub entry_id: EntryId,
    /// Decoded event.
    pub event: TestEvent,
    /// Error count the entry carried into this attempt.
    pub error_count: u32,
    /// When the handler was invoked.
    pub at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn delivery(event: TestEvent, ctx: &DispatchContext) -> Delivery {
    Delivery { entry_id: ctx.entry_id, event, error_count: ctx.error_count, at: Instant::now() }
}

/// Records every delivery and succeeds.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery so far, in invocation order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.deliveries).clone()
    }

    /// Number of deliveries so far.
    pub fn count(&self) -> usize {
        lock(&self.deliveries).len()
    }

    /// Delivered entry ids, in invocation order.
    pub fn entry_ids(&self) -> Vec<EntryId> {
        lock(&self.deliveries).iter().map(|d| d.entry_id).collect()
    }
}

#[async_trait]
impl EventHandler<TestEvent> for RecordingHandler {
    async fn handle(&self, event: TestEvent, ctx: &DispatchContext) -> Result<(), HandlerError> {
        lock(&self.deliveries).push(delivery(event, ctx));
        Ok(())
    }
}

/// Fails the first `failures` attempts of every entry, then succeeds.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    failures: u32,
    attempts: Arc<Mutex<HashMap<EntryId, Vec<Delivery>>>>,
}

impl ScriptedHandler {
    /// Handler failing each entry `failures` times before succeeding.
    pub fn fail_times(failures: u32) -> Self {
        Self { failures, attempts: Arc::default() }
    }

    /// Attempts recorded for `entry_id`.
    pub fn attempts(&self, entry_id: EntryId) -> Vec<Delivery> {
        lock(&self.attempts).get(&entry_id).cloned().unwrap_or_default()
    }

    /// Total invocations across entries.
    pub fn total_calls(&self) -> usize {
        lock(&self.attempts).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventHandler<TestEvent> for ScriptedHandler {
    async fn handle(&self, event: TestEvent, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let attempt = {
            let mut attempts = lock(&self.attempts);
            let history = attempts.entry(ctx.entry_id).or_default();
            history.push(delivery(event, ctx));
            history.len()
        };

        if attempt <= self.failures as usize {
            anyhow::bail!("scripted failure {attempt} of {}", self.failures);
        }
        Ok(())
    }
}

/// Fails every attempt.
#[derive(Debug, Clone, Default)]
pub struct AlwaysFailingHandler {
    calls: Arc<AtomicU32>,
}

impl AlwaysFailingHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler<TestEvent> for AlwaysFailingHandler {
    async fn handle(&self, _event: TestEvent, _ctx: &DispatchContext) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::bail!("permanent failure on call {call}")
    }
}

/// Sleeps before succeeding, recording completions.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    delay: Duration,
    completed: RecordingHandler,
}

impl SlowHandler {
    /// Handler taking `delay` per event.
    pub fn new(delay: Duration) -> Self {
        Self { delay, completed: RecordingHandler::new() }
    }

    /// Number of events that finished.
    pub fn completed(&self) -> usize {
        self.completed.count()
    }
}

#[async_trait]
impl EventHandler<TestEvent> for SlowHandler {
    async fn handle(&self, event: TestEvent, ctx: &DispatchContext) -> Result<(), HandlerError> {
        tokio::time::sleep(self.delay).await;
        self.completed.handle(event, ctx).await
    }
}
