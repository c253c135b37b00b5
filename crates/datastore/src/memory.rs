//! In-memory datastore with optimistic concurrency (does not persist across restarts).

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::trace;

use crate::{DatastoreError, Entry, Key, Query, Transaction, TxnDatastore};

/// Committed value plus the commit version that last touched it.
/// `value == None` is a tombstone kept only while older transactions are open.
#[derive(Debug, Clone)]
struct Record {
    value: Option<Vec<u8>>,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, Record>,
    /// Version of the latest commit.
    version: u64,
    /// Start versions of open transactions, with multiplicity.
    open: BTreeMap<u64, usize>,
}

impl Inner {
    fn modified_since(&self, key: &str, start: u64) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.version > start)
    }

    fn prefix_modified_since(&self, bound: &str, start: u64) -> bool {
        self.records
            .range::<str, _>((Bound::Included(bound), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(bound))
            .any(|(_, record)| record.version > start)
    }

    /// Drop tombstones no open transaction can still conflict on.
    fn compact(&mut self) {
        let horizon = self.open.keys().next().copied().unwrap_or(self.version);
        self.records
            .retain(|_, record| record.value.is_some() || record.version > horizon);
    }
}

/// In-memory transactional store.
///
/// Transactions read the latest committed state and buffer their writes.
/// Commit fails with [`DatastoreError::Conflict`] if any key the transaction
/// read or wrote, or any prefix it queried, was changed by a commit made after
/// the transaction began.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    inner: RwLock<Inner>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-deleted) records.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .records
            .values()
            .filter(|record| record.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, start: u64) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.open.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                inner.open.remove(&start);
            }
        }
        inner.compact();
    }
}

impl TxnDatastore for MemoryDatastore {
    type Txn<'a>
        = MemoryTxn<'a>
    where
        Self: 'a;

    fn new_transaction(&self, read_only: bool) -> Result<MemoryTxn<'_>, DatastoreError> {
        let mut inner = self.inner.write();
        let start = inner.version;
        *inner.open.entry(start).or_insert(0) += 1;

        Ok(MemoryTxn {
            store: self,
            read_only,
            start,
            reads: HashSet::new(),
            prefix_reads: Vec::new(),
            writes: BTreeMap::new(),
        })
    }
}

/// Transaction over a [`MemoryDatastore`].
#[derive(Debug)]
pub struct MemoryTxn<'a> {
    store: &'a MemoryDatastore,
    read_only: bool,
    start: u64,
    reads: HashSet<String>,
    prefix_reads: Vec<String>,
    /// Pending writes; `None` deletes.
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl MemoryTxn<'_> {
    fn ensure_writable(&self) -> Result<(), DatastoreError> {
        if self.read_only {
            return Err(DatastoreError::ReadOnly);
        }
        Ok(())
    }
}

impl Transaction for MemoryTxn<'_> {
    fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        if let Some(pending) = self.writes.get(key.as_str()) {
            return Ok(pending.clone());
        }
        self.reads.insert(key.as_str().to_string());

        let inner = self.store.inner.read();
        Ok(inner
            .records
            .get(key.as_str())
            .and_then(|record| record.value.clone()))
    }

    fn put(&mut self, key: &Key, value: &[u8]) -> Result<(), DatastoreError> {
        self.ensure_writable()?;
        self.writes
            .insert(key.as_str().to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> Result<(), DatastoreError> {
        self.ensure_writable()?;
        self.writes.insert(key.as_str().to_string(), None);
        Ok(())
    }

    fn query(&mut self, query: &Query) -> Result<Vec<Entry>, DatastoreError> {
        let bound = query.prefix.descendant_bound();
        self.prefix_reads.push(bound.clone());

        let mut view: BTreeMap<String, Option<Vec<u8>>> = {
            let inner = self.store.inner.read();
            inner
                .records
                .range::<str, _>((Bound::Included(bound.as_str()), Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(&bound))
                .filter_map(|(key, record)| {
                    record
                        .value
                        .as_ref()
                        .map(|value| (key.clone(), Some(value.clone())))
                })
                .collect()
        };

        for (key, pending) in self
            .writes
            .range::<str, _>((Bound::Included(bound.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&bound))
        {
            view.insert(key.clone(), pending.clone());
        }

        Ok(view
            .into_iter()
            .filter_map(|(key, value)| {
                value.map(|value| Entry {
                    key: Key::new(key),
                    value: if query.keys_only { Vec::new() } else { value },
                })
            })
            .collect())
    }

    fn commit(mut self) -> Result<(), DatastoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let mut inner = self.store.inner.write();

        let conflicting = self
            .reads
            .iter()
            .chain(self.writes.keys())
            .any(|key| inner.modified_since(key, self.start))
            || self
                .prefix_reads
                .iter()
                .any(|bound| inner.prefix_modified_since(bound, self.start));
        if conflicting {
            trace!(start = self.start, latest = inner.version, "memory txn conflict");
            return Err(DatastoreError::Conflict);
        }

        inner.version += 1;
        let version = inner.version;
        for (key, value) in std::mem::take(&mut self.writes) {
            inner.records.insert(key, Record { value, version });
        }
        Ok(())
    }
}

impl Drop for MemoryTxn<'_> {
    fn drop(&mut self) {
        self.store.release(self.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> Key {
        Key::new(path)
    }

    #[test]
    fn test_basic() {
        let store = MemoryDatastore::new();
        assert!(store.is_empty());

        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key("/a/1"), b"one").unwrap();
        assert!(txn.has(&key("/a/1")).unwrap());
        txn.commit().unwrap();
        assert_eq!(store.len(), 1);

        let mut txn = store.new_transaction(true).unwrap();
        assert_eq!(txn.get(&key("/a/1")).unwrap(), Some(b"one".to_vec()));
        assert!(!txn.has(&key("/a/2")).unwrap());
    }

    #[test]
    fn test_discard_leaves_no_effect() {
        let store = MemoryDatastore::new();

        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key("/a/1"), b"one").unwrap();
        txn.discard();

        assert!(store.is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryDatastore::new();
        let mut txn = store.new_transaction(true).unwrap();
        assert_eq!(txn.put(&key("/a"), b"x"), Err(DatastoreError::ReadOnly));
        assert_eq!(txn.delete(&key("/a")), Err(DatastoreError::ReadOnly));
    }

    #[test]
    fn test_query_prefix_ordered_with_own_writes() {
        let store = MemoryDatastore::new();
        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key("/a/2"), b"two").unwrap();
        txn.put(&key("/a/1"), b"one").unwrap();
        txn.put(&key("/a-x/1"), b"other").unwrap();
        txn.put(&key("/b/1"), b"b").unwrap();
        txn.commit().unwrap();

        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key("/a/3"), b"three").unwrap();
        txn.delete(&key("/a/1")).unwrap();

        let entries = txn.query(&Query::prefix(key("/a"))).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/2", "/a/3"]);
        assert_eq!(entries[0].value, b"two".to_vec());

        let all = txn.query(&Query::all().keys_only()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|e| e.value.is_empty()));
    }

    #[test]
    fn test_write_write_conflict() {
        let store = MemoryDatastore::new();

        let mut first = store.new_transaction(false).unwrap();
        let mut second = store.new_transaction(false).unwrap();
        first.put(&key("/a/1"), b"first").unwrap();
        second.put(&key("/a/1"), b"second").unwrap();

        first.commit().unwrap();
        assert_eq!(second.commit(), Err(DatastoreError::Conflict));

        let mut txn = store.new_transaction(true).unwrap();
        assert_eq!(txn.get(&key("/a/1")).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_read_write_conflict() {
        let store = MemoryDatastore::new();

        let mut reader = store.new_transaction(false).unwrap();
        assert!(!reader.has(&key("/a/1")).unwrap());
        reader.put(&key("/a/2"), b"two").unwrap();

        let mut writer = store.new_transaction(false).unwrap();
        writer.put(&key("/a/1"), b"one").unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.commit(), Err(DatastoreError::Conflict));
    }

    #[test]
    fn test_prefix_query_conflict() {
        let store = MemoryDatastore::new();

        let mut scanner = store.new_transaction(false).unwrap();
        assert!(scanner.query(&Query::prefix(key("/a"))).unwrap().is_empty());
        scanner.put(&key("/b/1"), b"b").unwrap();

        let mut writer = store.new_transaction(false).unwrap();
        writer.put(&key("/a/1"), b"one").unwrap();
        writer.commit().unwrap();

        assert_eq!(scanner.commit(), Err(DatastoreError::Conflict));
    }

    #[test]
    fn test_disjoint_keys_do_not_conflict() {
        let store = MemoryDatastore::new();

        let mut first = store.new_transaction(false).unwrap();
        let mut second = store.new_transaction(false).unwrap();
        assert!(!first.has(&key("/a/1")).unwrap());
        first.put(&key("/a/1"), b"a").unwrap();
        assert!(!second.has(&key("/b/1")).unwrap());
        second.put(&key("/b/1"), b"b").unwrap();

        first.commit().unwrap();
        second.commit().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_conflicts_with_older_txn_then_compacts() {
        let store = MemoryDatastore::new();
        let mut txn = store.new_transaction(false).unwrap();
        txn.put(&key("/a/1"), b"one").unwrap();
        txn.commit().unwrap();

        let mut old = store.new_transaction(false).unwrap();
        let mut deleter = store.new_transaction(false).unwrap();
        deleter.delete(&key("/a/1")).unwrap();
        deleter.commit().unwrap();

        old.put(&key("/a/1"), b"again").unwrap();
        assert_eq!(old.commit(), Err(DatastoreError::Conflict));

        // No open transactions left, the tombstone is gone.
        assert_eq!(store.inner.read().records.len(), 0);
    }
}
