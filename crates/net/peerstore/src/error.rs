//! Address book errors.

use libp2p::Multiaddr;
use thiserror::Error;
use vertex_datastore::DatastoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrBookError {
    /// An address could not be turned into a record key. Only that address is dropped.
    #[error("failed to encode address {addr}: {reason}")]
    Encoding { addr: Multiaddr, reason: String },

    /// Every attempt of a transactional write failed with a retryable error.
    #[error("write failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: DatastoreError,
    },

    /// Read-path failure. Never retried.
    #[error("query failed: {0}")]
    Query(DatastoreError),

    /// Non-retryable store failure on the write path.
    #[error("store error: {0}")]
    Store(#[from] DatastoreError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The sweeper could not be started.
    #[error("no tokio runtime: {0}")]
    Runtime(String),
}

impl AddrBookError {
    /// True when the write lost to concurrent writers on every attempt.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted {
                last: DatastoreError::Conflict,
                ..
            }
        )
    }
}
