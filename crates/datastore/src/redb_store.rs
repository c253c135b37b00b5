//! redb-backed datastore.
//!
//! redb serializes write transactions, so commits never conflict; a second
//! writer waits in [`TxnDatastore::new_transaction`] until the first finishes.

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;

use crate::{DatastoreError, Entry, Key, Query, Transaction, TxnDatastore};

/// Key: cleaned datastore key. Value: raw record bytes.
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Persistent datastore on a single redb file.
pub struct RedbDatastore {
    db: Database,
}

impl std::fmt::Debug for RedbDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDatastore").finish_non_exhaustive()
    }
}

impl RedbDatastore {
    /// Open or create a datastore at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatastoreError> {
        let db = Database::create(path)?;

        // Ensure the records table exists so read transactions can open it.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
        }
        write_txn.commit()?;

        debug!("opened redb datastore");
        Ok(Self { db })
    }
}

impl TxnDatastore for RedbDatastore {
    type Txn<'a>
        = RedbTxn
    where
        Self: 'a;

    fn new_transaction(&self, read_only: bool) -> Result<RedbTxn, DatastoreError> {
        if read_only {
            Ok(RedbTxn::Read(self.db.begin_read()?))
        } else {
            Ok(RedbTxn::Write(self.db.begin_write()?))
        }
    }
}

/// Transaction over a [`RedbDatastore`]. Dropping a write transaction aborts it.
pub enum RedbTxn {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

fn get_value<T>(table: &T, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let value = table.get(key.as_str())?.map(|guard| guard.value().to_vec());
    Ok(value)
}

fn query_table<T>(table: &T, query: &Query) -> Result<Vec<Entry>, DatastoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let bound = query.prefix.descendant_bound();
    let mut entries = Vec::new();

    for item in table.range(bound.as_str()..)? {
        let (key, value) = item?;
        let key = key.value();
        if !key.starts_with(&bound) {
            break;
        }
        entries.push(Entry {
            key: Key::new(key),
            value: if query.keys_only {
                Vec::new()
            } else {
                value.value().to_vec()
            },
        });
    }

    Ok(entries)
}

impl Transaction for RedbTxn {
    fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        match self {
            Self::Read(txn) => get_value(&txn.open_table(RECORDS_TABLE)?, key),
            Self::Write(txn) => get_value(&txn.open_table(RECORDS_TABLE)?, key),
        }
    }

    fn put(&mut self, key: &Key, value: &[u8]) -> Result<(), DatastoreError> {
        match self {
            Self::Read(_) => Err(DatastoreError::ReadOnly),
            Self::Write(txn) => {
                let mut table = txn.open_table(RECORDS_TABLE)?;
                table.insert(key.as_str(), value)?;
                Ok(())
            }
        }
    }

    fn delete(&mut self, key: &Key) -> Result<(), DatastoreError> {
        match self {
            Self::Read(_) => Err(DatastoreError::ReadOnly),
            Self::Write(txn) => {
                let mut table = txn.open_table(RECORDS_TABLE)?;
                table.remove(key.as_str())?;
                Ok(())
            }
        }
    }

    fn query(&mut self, query: &Query) -> Result<Vec<Entry>, DatastoreError> {
        match self {
            Self::Read(txn) => query_table(&txn.open_table(RECORDS_TABLE)?, query),
            Self::Write(txn) => query_table(&txn.open_table(RECORDS_TABLE)?, query),
        }
    }

    fn commit(self) -> Result<(), DatastoreError> {
        match self {
            Self::Read(_) => Ok(()),
            Self::Write(txn) => Ok(txn.commit()?),
        }
    }
}

impl From<redb::DatabaseError> for DatastoreError {
    fn from(err: redb::DatabaseError) -> Self {
        DatastoreError::Backend(err.to_string())
    }
}

impl From<redb::TransactionError> for DatastoreError {
    fn from(err: redb::TransactionError) -> Self {
        DatastoreError::Backend(err.to_string())
    }
}

impl From<redb::TableError> for DatastoreError {
    fn from(err: redb::TableError) -> Self {
        DatastoreError::Backend(err.to_string())
    }
}

impl From<redb::StorageError> for DatastoreError {
    fn from(err: redb::StorageError) -> Self {
        DatastoreError::Backend(err.to_string())
    }
}

impl From<redb::CommitError> for DatastoreError {
    fn from(err: redb::CommitError) -> Self {
        DatastoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = RedbDatastore::open(dir.path().join("test.redb")).unwrap();

        let key = Key::new("/peer/1");
        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key, b"hello").unwrap();
        assert!(txn.has(&key).unwrap());
        txn.commit().unwrap();

        let mut txn = store.new_transaction(true).unwrap();
        assert_eq!(txn.get(&key).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(txn.put(&key, b"nope"), Err(DatastoreError::ReadOnly));
        drop(txn);

        let mut txn = store.new_transaction(false).unwrap();
        txn.delete(&key).unwrap();
        txn.commit().unwrap();

        let mut txn = store.new_transaction(true).unwrap();
        assert!(!txn.has(&key).unwrap());
    }

    #[test]
    fn test_uncommitted_write_is_discarded() {
        let dir = tempdir().unwrap();
        let store = RedbDatastore::open(dir.path().join("test.redb")).unwrap();

        let key = Key::new("/peer/1");
        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key, b"hello").unwrap();
        txn.discard();

        let mut txn = store.new_transaction(true).unwrap();
        assert!(!txn.has(&key).unwrap());
    }

    #[test]
    fn test_prefix_query() {
        let dir = tempdir().unwrap();
        let store = RedbDatastore::open(dir.path().join("test.redb")).unwrap();

        let mut txn = store.new_transaction(false).unwrap();
        for path in ["/a/2", "/a/1", "/a-x/1", "/b/1"] {
            txn.put(&Key::new(path), path.as_bytes()).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = store.new_transaction(true).unwrap();
        let entries = txn.query(&Query::prefix(Key::new("/a"))).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
        assert_eq!(entries[0].value, b"/a/1".to_vec());

        let all = txn.query(&Query::all().keys_only()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|e| e.value.is_empty()));
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let key = Key::new("/peer/1");

        {
            let store = RedbDatastore::open(&path).unwrap();
            let mut txn = store.new_transaction(false).unwrap();
            txn.put(&key, b"kept").unwrap();
            txn.commit().unwrap();
        }

        let store = RedbDatastore::open(&path).unwrap();
        let mut txn = store.new_transaction(true).unwrap();
        assert_eq!(txn.get(&key).unwrap(), Some(b"kept".to_vec()));
    }
}
