//! Core types for the spool event bus.
//!
//! Defines the durable [`Entry`] record and its lifecycle, node identity, the
//! [`EntryStore`] contract every storage backend implements, the
//! [`CommitNotifier`] fired after local transactions end, and the [`Clock`]
//! abstraction used wherever timestamps are taken.
//!
//! Two backends ship with the crate: [`MemoryEntryStore`] for single-process
//! use and tests, and [`PostgresEntryStore`] for clusters sharing one table.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod notifier;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Entry, EntryId, EntryState, NewEntry, NodeId, Payload, SearchKeys};
pub use notifier::{CommitNotifier, NotificationSubscription, TransactionEvent, TransactionOutcome};
pub use storage::{
    memory::MemoryEntryStore,
    postgres::{PostgresEntryStore, TableNames},
    EngineKind, EntryStore, ReapPolicy, StoreFuture,
};
pub use time::{Clock, RealClock, TestClock};

/// Default table holding live entries.
pub const DEFAULT_TABLE_NAME: &str = "spool_entries";

/// Default table receiving purged terminal entries.
pub const DEFAULT_HISTORY_TABLE_NAME: &str = "spool_entries_history";
