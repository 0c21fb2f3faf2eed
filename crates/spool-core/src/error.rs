//! Error types for entry storage operations.
//!
//! Storage backends translate driver failures into [`CoreError`] so the
//! dispatch engine can tell a lost optimistic race apart from an unavailable
//! store without inspecting backend-specific errors.

use thiserror::Error;

use crate::models::{EntryId, EntryState};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The store could not be reached (pool exhausted, connection lost, or
    /// injected failure).
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An update lost the optimistic race: the stored entry is no longer the
    /// claimed version the caller holds.
    #[error("entry {id} was modified concurrently")]
    ConcurrentModification {
        /// Entry whose update was rejected
        id: EntryId,
    },

    /// The requested lifecycle transition is not allowed.
    #[error("entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Entry the transition was requested for
        id: EntryId,
        /// Current state
        from: EntryState,
        /// Requested state
        to: EntryState,
    },

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns whether the failure is transient and the operation may succeed
    /// on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entry not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::StoreUnavailable(err.to_string())
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::InvalidInput(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_map_to_store_unavailable() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn lost_race_is_not_transient() {
        let err = CoreError::ConcurrentModification { id: EntryId(7) };
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "entry 7 was modified concurrently");
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = CoreError::InvalidTransition {
            id: EntryId(3),
            from: EntryState::Processed,
            to: EntryState::Available,
        };
        assert_eq!(err.to_string(), "entry 3 cannot move from PROCESSED to AVAILABLE");
    }
}
