//! Lock error types.

use thiserror::Error;

/// Result type alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors raised by lockers and coordination clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The coordination service rejected or failed an operation.
    #[error("coordination failure: {0}")]
    Coordination(String),

    /// The session holding the lock node expired; the lock is gone.
    #[error("session expired, lock node {path} no longer exists")]
    SessionExpired {
        /// Lock node that was lost
        path: String,
    },

    /// The connection to the coordination service is down.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// Service or key cannot form a lock path.
    #[error("invalid lock path component: {0:?}")]
    InvalidPath(String),
}

impl LockError {
    /// Returns whether the operation may succeed once the session recovers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}

/// Lock directory for `service` and `key`.
///
/// # Errors
///
/// Returns `LockError::InvalidPath` for empty components or components
/// containing `/`.
pub(crate) fn lock_dir(service: &str, key: &str) -> Result<String> {
    for component in [service, key] {
        if component.is_empty() || component.contains('/') {
            return Err(LockError::InvalidPath(component.to_string()));
        }
    }
    Ok(format!("/{service}/{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_dir_rejects_bad_components() {
        assert_eq!(lock_dir("billing", "cust-1").unwrap(), "/billing/cust-1");
        assert!(matches!(lock_dir("", "k"), Err(LockError::InvalidPath(_))));
        assert!(matches!(lock_dir("svc", "a/b"), Err(LockError::InvalidPath(_))));
    }
}
