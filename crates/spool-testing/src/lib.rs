//! Test infrastructure for the spool bus.
//!
//! Provides event fixtures and entry builders, scripted handlers that fail
//! on demand, polling helpers for asynchronous assertions, and invariant
//! checks with proptest strategies.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod handlers;
pub mod invariants;
pub mod wait;

pub use fixtures::{new_entry, EntryBuilder, TestEvent};
pub use handlers::{AlwaysFailingHandler, Delivery, RecordingHandler, ScriptedHandler, SlowHandler};
pub use invariants::{strategies, Invariants};
pub use spool_core::{Clock, TestClock};
pub use wait::{wait_for_state, wait_until};
