//! Address records in a transactional datastore.
//!
//! Each method below is one transaction and one attempt. Callers wrap write
//! attempts in [`AddrStore::with_retries`].

use std::collections::HashSet;
use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};
use tracing::{error, trace, warn};
use vertex_datastore::{DatastoreError, Key, Query, Transaction, TxnDatastore};

use crate::error::AddrBookError;
use crate::key::peer_from_key;
use crate::metrics::AddrBookMetrics;

/// Persistent store adapter for address records.
pub struct AddrStore<D> {
    ds: Arc<D>,
    attempts: u32,
    metrics: AddrBookMetrics,
}

impl<D> std::fmt::Debug for AddrStore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrStore")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl<D: TxnDatastore> AddrStore<D> {
    /// `attempts` is clamped to at least one.
    pub fn new(ds: Arc<D>, attempts: u32, metrics: AddrBookMetrics) -> Self {
        Self {
            ds,
            attempts: attempts.max(1),
            metrics,
        }
    }

    pub fn datastore(&self) -> &Arc<D> {
        &self.ds
    }

    /// Write every absent record. Returns, per key, whether it already existed.
    ///
    /// Keys embed a digest of the value, so an existing key is never rewritten.
    pub fn insert(&self, keys: &[Key], addrs: &[Multiaddr]) -> Result<Vec<bool>, DatastoreError> {
        let mut txn = self.ds.new_transaction(false)?;
        let mut existed = Vec::with_capacity(keys.len());

        for (key, addr) in keys.iter().zip(addrs) {
            let exists = txn.has(key)?;
            existed.push(exists);
            if !exists {
                txn.put(key, &addr.to_vec())?;
            }
        }

        txn.commit()?;
        Ok(existed)
    }

    pub fn delete(&self, keys: &[Key]) -> Result<(), DatastoreError> {
        let mut txn = self.ds.new_transaction(false)?;
        for key in keys {
            txn.delete(key)?;
        }
        txn.commit()
    }

    /// Delete every record below `prefix`, returning the deleted keys.
    pub fn delete_prefix(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError> {
        let mut txn = self.ds.new_transaction(false)?;
        let entries = txn.query(&Query::prefix(prefix.clone()).keys_only())?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            txn.delete(&entry.key)?;
            keys.push(entry.key);
        }

        txn.commit()?;
        Ok(keys)
    }

    /// Addresses stored below `prefix`, in key order. Undecodable records are skipped.
    pub fn query_addrs(&self, prefix: &Key) -> Result<Vec<Multiaddr>, AddrBookError> {
        let mut txn = self
            .ds
            .new_transaction(true)
            .map_err(AddrBookError::Query)?;
        let entries = txn
            .query(&Query::prefix(prefix.clone()))
            .map_err(AddrBookError::Query)?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match Multiaddr::try_from(entry.value) {
                Ok(addr) => Some(addr),
                Err(err) => {
                    trace!(key = %entry.key, %err, "skipping malformed address record");
                    None
                }
            })
            .collect())
    }

    /// Every peer with at least one stored record.
    pub fn query_peers(&self) -> Result<HashSet<PeerId>, AddrBookError> {
        let mut txn = self
            .ds
            .new_transaction(true)
            .map_err(AddrBookError::Query)?;
        let entries = txn
            .query(&Query::all().keys_only())
            .map_err(AddrBookError::Query)?;

        Ok(entries
            .iter()
            .filter_map(|entry| peer_from_key(&entry.key))
            .collect())
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Conflicts and backend errors are retried immediately. Anything else is
    /// returned after the first attempt.
    pub fn with_retries<T>(
        &self,
        peer: &PeerId,
        mut op: impl FnMut(&Self) -> Result<T, DatastoreError>,
    ) -> Result<T, AddrBookError> {
        let mut last = DatastoreError::Conflict;

        for attempt in 1..=self.attempts {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(%peer, attempt, attempts = self.attempts, %err, "address write failed");
                    self.metrics.inc_write_retries();
                    last = err;
                }
                Err(err) => {
                    error!(%peer, %err, "address write aborted");
                    self.metrics.inc_write_failures();
                    return Err(AddrBookError::Store(err));
                }
            }
        }

        error!(%peer, attempts = self.attempts, err = %last, "giving up on address write");
        self.metrics.inc_write_failures();
        Err(AddrBookError::RetriesExhausted {
            attempts: self.attempts,
            last,
        })
    }
}
