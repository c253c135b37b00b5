//! Fault injection for exercising conflict-retry and failure paths.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::{DatastoreError, Entry, Key, Query, Transaction, TxnDatastore};

/// Wraps a datastore and fails the next `n` write commits with
/// [`DatastoreError::Conflict`] (or a backend error, see [`Self::with_backend_errors`]).
///
/// Reads can be failed wholesale with [`Self::fail_reads`], and the next commit
/// that deletes keys can be held open with [`Self::hold_next_delete_commit`].
#[derive(Debug)]
pub struct ConflictingDatastore<D> {
    inner: D,
    pending_failures: AtomicU32,
    commits: AtomicU32,
    fail_reads: AtomicBool,
    delete_hold: Mutex<Option<HeldCommit>>,
    error: DatastoreError,
}

#[derive(Debug)]
struct HeldCommit {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Handle on a delete commit paused by [`ConflictingDatastore::hold_next_delete_commit`].
///
/// Dropping the handle releases the commit.
#[derive(Debug)]
pub struct CommitHold {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl CommitHold {
    /// Block until a delete commit has reached the hold.
    pub fn wait_held(&self) {
        let _ = self.entered.recv();
    }

    /// Let the held commit proceed.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

impl<D: TxnDatastore> ConflictingDatastore<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            pending_failures: AtomicU32::new(0),
            commits: AtomicU32::new(0),
            fail_reads: AtomicBool::new(false),
            delete_hold: Mutex::new(None),
            error: DatastoreError::Conflict,
        }
    }

    /// Inject backend failures instead of conflicts.
    pub fn with_backend_errors(mut self) -> Self {
        self.error = DatastoreError::Backend("injected failure".to_string());
        self
    }

    /// Fail the next `n` commits of write transactions.
    pub fn fail_next_commits(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Number of write-transaction commit attempts, failed ones included.
    pub fn commit_attempts(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Fail every read-only transaction with the injected error while `fail` is set.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Pause the next write commit that deletes keys, before it reaches the inner
    /// datastore, until the returned handle is released or dropped.
    pub fn hold_next_delete_commit(&self) -> CommitHold {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.delete_hold.lock() = Some(HeldCommit {
            entered: entered_tx,
            release: release_rx,
        });
        CommitHold {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<D: TxnDatastore> TxnDatastore for ConflictingDatastore<D> {
    type Txn<'a>
        = ConflictingTxn<'a, D>
    where
        Self: 'a;

    fn new_transaction(&self, read_only: bool) -> Result<ConflictingTxn<'_, D>, DatastoreError> {
        if read_only && self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.error.clone());
        }
        Ok(ConflictingTxn {
            txn: self.inner.new_transaction(read_only)?,
            store: self,
            read_only,
            deletes: false,
        })
    }
}

pub struct ConflictingTxn<'a, D: TxnDatastore + 'a> {
    txn: D::Txn<'a>,
    store: &'a ConflictingDatastore<D>,
    read_only: bool,
    deletes: bool,
}

impl<D: TxnDatastore> Transaction for ConflictingTxn<'_, D> {
    fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        self.txn.get(key)
    }

    fn put(&mut self, key: &Key, value: &[u8]) -> Result<(), DatastoreError> {
        self.txn.put(key, value)
    }

    fn delete(&mut self, key: &Key) -> Result<(), DatastoreError> {
        self.deletes = true;
        self.txn.delete(key)
    }

    fn query(&mut self, query: &Query) -> Result<Vec<Entry>, DatastoreError> {
        self.txn.query(query)
    }

    fn commit(self) -> Result<(), DatastoreError> {
        if self.read_only {
            return self.txn.commit();
        }
        self.store.commits.fetch_add(1, Ordering::SeqCst);
        if self.store.take_failure() {
            return Err(self.store.error.clone());
        }
        if self.deletes {
            let held = self.store.delete_hold.lock().take();
            if let Some(held) = held {
                let _ = held.entered.send(());
                let _ = held.release.recv();
            }
        }
        self.txn.commit()
    }
}
