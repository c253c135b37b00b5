//! Transactional key-value datastore with hierarchical keys.
//!
//! Values live under slash-separated [`Key`]s. All access goes through a
//! [`Transaction`] obtained from a [`TxnDatastore`]; dropping a transaction
//! without committing discards it.

mod error;
mod key;
mod memory;
mod redb_store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::DatastoreError;
pub use key::Key;
pub use memory::{MemoryDatastore, MemoryTxn};
pub use redb_store::{RedbDatastore, RedbTxn};

/// Prefix query over a transaction's view of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Only keys strictly below this one are returned. The root matches everything.
    pub prefix: Key,
    /// Skip loading values.
    pub keys_only: bool,
}

impl Query {
    pub fn all() -> Self {
        Self {
            prefix: Key::root(),
            keys_only: false,
        }
    }

    pub fn prefix(prefix: Key) -> Self {
        Self {
            prefix,
            keys_only: false,
        }
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }
}

/// One query result. `value` is empty for keys-only queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Vec<u8>,
}

/// A unit of work against the datastore.
///
/// Reads observe the transaction's own uncommitted writes. Dropping the
/// transaction without calling [`Transaction::commit`] leaves no effect.
pub trait Transaction {
    fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError>;

    fn has(&mut self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&mut self, key: &Key, value: &[u8]) -> Result<(), DatastoreError>;

    fn delete(&mut self, key: &Key) -> Result<(), DatastoreError>;

    /// Entries below the query prefix, ordered by key.
    fn query(&mut self, query: &Query) -> Result<Vec<Entry>, DatastoreError>;

    /// Atomically apply every write, or fail without partial effect.
    fn commit(self) -> Result<(), DatastoreError>;

    fn discard(self)
    where
        Self: Sized,
    {
    }
}

/// A datastore that hands out transactions.
pub trait TxnDatastore: Send + Sync + 'static {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn new_transaction(&self, read_only: bool) -> Result<Self::Txn<'_>, DatastoreError>;
}
