//! Error types for claim and dispatch operations.
//!
//! Decode and handler failures never escape a worker: they become entry
//! state transitions. The variants here surface from the public API
//! (`post`, `start`, `shutdown`, `process_once`) and inside logs.

use std::{fmt, time::Duration};

use spool_core::{CoreError, EntryId};
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error returned by application handlers.
pub type HandlerError = anyhow::Error;

/// Errors raised while claiming, dispatching or managing the worker pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payload could not be decoded, or no codec is registered for its
    /// discriminator. Retrying cannot help.
    #[error("cannot decode {event_type} payload: {message}")]
    Decode {
        /// Discriminator of the offending payload
        event_type: String,
        /// Decoder message
        message: String,
    },

    /// The application handler failed.
    #[error("handler for {event_type} failed: {message}")]
    Handler {
        /// Discriminator of the event being handled
        event_type: String,
        /// Handler error message
        message: String,
    },

    /// A store call failed; the cycle is abandoned and retried on the next
    /// tick.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Store error message
        message: String,
    },

    /// An update lost its optimistic race.
    #[error("entry {id} was resolved elsewhere")]
    ConcurrentModification {
        /// Entry whose update was rejected
        id: EntryId,
    },

    /// Invalid dispatcher configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not finish within the shutdown grace period.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// Grace period that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker that panicked
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal dispatch error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DispatchError {
    /// Creates a decode error.
    pub fn decode(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode { event_type: event_type.into(), message: message.into() }
    }

    /// Creates a handler error.
    pub fn handler(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler { event_type: event_type.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns whether the failed operation may succeed if attempted again.
    ///
    /// Handler failures and store outages are retryable; decode failures,
    /// lost races and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler { .. } | Self::StoreUnavailable { .. } => true,

            Self::Decode { .. }
            | Self::ConcurrentModification { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConcurrentModification { id } => Self::ConcurrentModification { id },
            CoreError::InvalidInput(message) => Self::Configuration { message },
            CoreError::InvalidTransition { .. } => Self::internal(err.to_string()),
            other => Self::StoreUnavailable { message: other.to_string() },
        }
    }
}

/// Category of dispatch error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Payload problems.
    Decode,
    /// Application handler failures.
    Handler,
    /// Storage failures and lost races.
    Store,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle and internal errors.
    Internal,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::Decode { .. } => Self::Decode,
            DispatchError::Handler { .. } => Self::Handler,
            DispatchError::StoreUnavailable { .. } | DispatchError::ConcurrentModification { .. } => {
                Self::Store
            },
            DispatchError::Configuration { .. } => Self::Configuration,
            DispatchError::ShutdownTimeout { .. }
            | DispatchError::WorkerPanic { .. }
            | DispatchError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => write!(f, "decode"),
            Self::Handler => write!(f, "handler"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
