//! Datastore error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatastoreError {
    /// Another transaction committed a conflicting change first.
    #[error("transaction conflict")]
    Conflict,
    /// Mutation attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,
    /// Failure reported by the storage backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DatastoreError {
    /// Conflicts and backend failures are worth retrying with a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Backend(_))
    }
}
