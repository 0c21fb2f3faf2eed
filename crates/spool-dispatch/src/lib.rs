//! Claim, dispatch and retry engine for the spool event bus.
//!
//! A [`Dispatcher`] runs one node of the bus. A single claim loop moves
//! batches of due entries from the shared [`spool_core::EntryStore`] into a
//! bounded in-process queue; a fixed pool of workers drains the queue,
//! decodes each payload, runs the registered handler, and writes the
//! outcome back to the store.
//!
//! # Lifecycle
//!
//! 1. **Claim** - `ClaimManager` flips due `AVAILABLE` entries to
//!    `IN_PROCESSING` for this node, honouring sticky affinity
//! 2. **Dispatch** - `DispatchCallback` decodes and invokes the handler
//! 3. **Resolve** - the worker persists `PROCESSED`, `AVAILABLE` with backoff,
//!    or `FAILED` through an optimistic update
//! 4. **Recover** - the reaper returns claims orphaned by crashed nodes
//!
//! Delivery is at-least-once: a handler may see the same entry again after a
//! reap, so handlers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use spool_core::{MemoryEntryStore, NodeId, SearchKeys};
//! use spool_dispatch::{
//!     BusEvent, DispatchConfig, DispatchContext, Dispatcher, EventHandler, HandlerError,
//!     HandlerRegistry,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! impl BusEvent for OrderPlaced {
//!     const EVENT_TYPE: &'static str = "order.placed";
//! }
//!
//! struct ShipOrder;
//!
//! #[async_trait]
//! impl EventHandler<OrderPlaced> for ShipOrder {
//!     async fn handle(&self, event: OrderPlaced, _ctx: &DispatchContext) -> Result<(), HandlerError> {
//!         println!("shipping {}", event.order_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> spool_dispatch::Result<()> {
//! let registry = HandlerRegistry::new().with_handler::<OrderPlaced, _>(ShipOrder);
//! let mut dispatcher = Dispatcher::new(
//!     NodeId::new("node-a"),
//!     Arc::new(MemoryEntryStore::new()),
//!     registry,
//!     DispatchConfig::default(),
//! )?;
//!
//! dispatcher.start().await?;
//! dispatcher.post(&OrderPlaced { order_id: 7 }, SearchKeys::key1("order-7")).await?;
//! dispatcher.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod callback;
pub mod claim;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod retry;
mod worker;
mod worker_pool;

pub use callback::{
    encode_event, BusEvent, DispatchCallback, DispatchContext, DispatchOutcome, EventHandler,
    HandlerRegistry,
};
pub use claim::ClaimManager;
pub use config::{Config, DispatchConfig, PersistentQueueMode};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{DispatchError, ErrorCategory, HandlerError, Result};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};

/// Default number of concurrent dispatch workers.
pub const DEFAULT_DISPATCH_THREADS: usize = 4;

/// Default number of entries claimed per cycle.
pub const DEFAULT_MAX_ENTRIES_CLAIMED: usize = 10;

/// Default capacity of the internal work queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 100;
