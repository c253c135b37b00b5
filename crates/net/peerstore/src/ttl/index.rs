//! In-memory TTL index with sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};
use vertex_datastore::{Key, TxnDatastore};
use web_time::Instant;

use super::TtlEntry;
use crate::cache::AddrCache;
use crate::key::peer_from_key;
use crate::metrics::AddrBookMetrics;
use crate::store::AddrStore;

/// Tracks the TTL class and expiry of every address record written through the
/// address book.
///
/// One exclusive lock guards the whole map; the sweep holds it while deleting
/// expired records so API calls never observe a half-applied sweep.
pub struct TtlIndex<D> {
    entries: Mutex<HashMap<Key, TtlEntry>>,
    store: Arc<AddrStore<D>>,
    cache: Arc<dyn AddrCache>,
    metrics: AddrBookMetrics,
}

impl<D> std::fmt::Debug for TtlIndex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlIndex")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<D: TxnDatastore> TtlIndex<D> {
    pub fn new(
        store: Arc<AddrStore<D>>,
        cache: Arc<dyn AddrCache>,
        metrics: AddrBookMetrics,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
            cache,
            metrics,
        }
    }

    /// Track `keys` with `ttl`. Existing entries are only replaced by a later expiry.
    ///
    /// Returns the keys that were not tracked before the call.
    pub fn insert_or_extend(&self, keys: &[Key], ttl: Duration) -> Vec<Key> {
        let candidate = TtlEntry::new(ttl, Instant::now());
        let mut entries = self.entries.lock();

        let mut untracked = Vec::new();
        for key in keys {
            match entries.get_mut(key) {
                Some(entry) => {
                    if candidate.outlives(entry) {
                        *entry = candidate;
                    }
                }
                None => {
                    entries.insert(key.clone(), candidate);
                    untracked.push(key.clone());
                }
            }
        }
        untracked
    }

    /// Track `keys` with `ttl`, resetting any existing expiry.
    ///
    /// Returns the keys that were not tracked before the call.
    pub fn set(&self, keys: &[Key], ttl: Duration) -> Vec<Key> {
        let entry = TtlEntry::new(ttl, Instant::now());
        let mut entries = self.entries.lock();

        keys.iter()
            .filter(|key| entries.insert((*key).clone(), entry).is_none())
            .cloned()
            .collect()
    }

    pub fn delete(&self, keys: &[Key]) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
    }

    /// Move every entry below `prefix` tagged `old_ttl` to `new_ttl`, restarting its
    /// expiry from now. Returns the number of entries changed.
    pub fn reclass(&self, prefix: &Key, old_ttl: Duration, new_ttl: Duration) -> usize {
        let updated = TtlEntry::new(new_ttl, Instant::now());
        let mut entries = self.entries.lock();

        let mut changed = 0;
        for (key, entry) in entries.iter_mut() {
            if entry.ttl == old_ttl && key.is_descendant_of(prefix) {
                *entry = updated;
                changed += 1;
            }
        }

        trace!(%prefix, changed, "reclassed ttl entries");
        changed
    }

    /// Stop tracking every entry below `prefix`.
    pub fn clear_prefix(&self, prefix: &Key) {
        self.entries
            .lock()
            .retain(|key, _| !key.is_descendant_of(prefix));
    }

    pub fn get(&self, key: &Key) -> Option<TtlEntry> {
        self.entries.lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every expired record in one transaction.
    ///
    /// Entries are dropped from the index, and their peers' cache entries
    /// invalidated, only once the delete commits. On failure the index is left
    /// as is and the next sweep tries again. Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let expired: Vec<Key> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        if let Err(err) = self.store.delete(&expired) {
            error!(%err, count = expired.len(), "failed to delete expired addresses");
            self.metrics.inc_sweep_failures();
            return 0;
        }

        let mut peers = HashSet::new();
        for key in &expired {
            entries.remove(key);
            if let Some(peer) = peer_from_key(key) {
                peers.insert(peer);
            }
        }
        drop(entries);

        for peer in &peers {
            self.cache.remove(peer);
        }

        self.metrics.record_expired(expired.len());
        debug!(expired = expired.len(), peers = peers.len(), "swept expired addresses");
        expired.len()
    }
}
