//! Per-peer address list cache.
//!
//! The cache is a read-through accelerator for [`crate::AddressBook::addrs`]. Entries
//! are never patched: every mutation for a peer removes its entry and the next read
//! repopulates it from the store.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use auto_impl::auto_impl;
use libp2p::{Multiaddr, PeerId};
use lru::LruCache;
use parking_lot::Mutex;

/// Cache strategy injected into the address book, with auto-impl for &, Box, Arc.
///
/// Implementations hand out and take owned copies; callers never share a list
/// with the cache.
#[auto_impl(&, Box, Arc)]
pub trait AddrCache: Send + Sync {
    /// Look up a peer, counting as a use.
    fn get(&self, peer: &PeerId) -> Option<Vec<Multiaddr>>;

    /// Look up a peer without affecting eviction order.
    fn peek(&self, peer: &PeerId) -> Option<Vec<Multiaddr>>;

    fn add(&self, peer: PeerId, addrs: Vec<Multiaddr>);

    fn remove(&self, peer: &PeerId);

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Build the cache for a configured capacity. Zero selects [`NoopAddrCache`].
pub fn new_addr_cache(capacity: usize) -> Arc<dyn AddrCache> {
    match NonZeroUsize::new(capacity) {
        Some(capacity) => Arc::new(LruAddrCache::new(capacity)),
        None => Arc::new(NoopAddrCache),
    }
}

/// Bounded LRU cache of peer address lists.
///
/// Stands in for an adaptive replacement (ARC) cache: same bound and
/// invalidation contract, plain recency eviction.
pub struct LruAddrCache {
    cache: Mutex<LruCache<PeerId, Vec<Multiaddr>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruAddrCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for LruAddrCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruAddrCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl AddrCache for LruAddrCache {
    fn get(&self, peer: &PeerId) -> Option<Vec<Multiaddr>> {
        let addrs = self.cache.lock().get(peer).cloned();
        self.record(addrs.is_some());
        addrs
    }

    fn peek(&self, peer: &PeerId) -> Option<Vec<Multiaddr>> {
        self.cache.lock().peek(peer).cloned()
    }

    fn add(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.cache.lock().put(peer, addrs);
    }

    fn remove(&self, peer: &PeerId) {
        self.cache.lock().pop(peer);
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let cache = self.cache.lock();

        CacheStats {
            capacity: cache.cap().get(),
            size: cache.len(),
            hits,
            misses,
        }
    }
}

/// Cache that stores nothing; every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAddrCache;

impl AddrCache for NoopAddrCache {
    fn get(&self, _peer: &PeerId) -> Option<Vec<Multiaddr>> {
        None
    }

    fn peek(&self, _peer: &PeerId) -> Option<Vec<Multiaddr>> {
        None
    }

    fn add(&self, _peer: PeerId, _addrs: Vec<Multiaddr>) {}

    fn remove(&self, _peer: &PeerId) {}
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of cached peers.
    pub capacity: usize,
    /// Currently cached peers.
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits as f64 / total as f64) * 100.0
    }
}
