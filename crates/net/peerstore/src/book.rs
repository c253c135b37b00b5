//! Datastore-backed address book.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use vertex_datastore::{Key, TxnDatastore};

use crate::cache::{AddrCache, CacheStats, new_addr_cache};
use crate::config::AddrBookConfig;
use crate::error::AddrBookError;
use crate::key::{keys_and_addrs, peer_key};
use crate::metrics::AddrBookMetrics;
use crate::store::AddrStore;
use crate::subscriptions::{AddrStream, AddrSubscriptions};
use crate::ttl::{Sweeper, TtlIndex};

/// How a successful write updates the TTL index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtlUpdate {
    /// Keep the later of the existing and new expiry.
    Extend,
    /// Overwrite the existing expiry.
    Reset,
}

/// Address book over a shared transactional datastore.
///
/// Records live in the datastore under `/<peer>/<address digest>`. Expiry is
/// tracked in memory and enforced by a background sweep every
/// [`AddrBookConfig::ttl_interval`], so an address can outlive its TTL by up to
/// one interval.
///
/// All methods except [`AddressBook::shutdown`] are synchronous and may block on
/// datastore I/O. Cache entries are invalidated before a write is attempted, so
/// a concurrent reader may briefly cache a list the pending write supersedes.
pub struct AddressBook<D: TxnDatastore> {
    config: AddrBookConfig,
    store: Arc<AddrStore<D>>,
    cache: Arc<dyn AddrCache>,
    ttls: Arc<TtlIndex<D>>,
    subscriptions: AddrSubscriptions,
    sweeper: Sweeper,
    metrics: AddrBookMetrics,
}

impl<D: TxnDatastore> std::fmt::Debug for AddressBook<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("config", &self.config)
            .field("ttls", &self.ttls)
            .field("sweeper", &self.sweeper)
            .finish_non_exhaustive()
    }
}

impl<D: TxnDatastore> AddressBook<D> {
    /// Create an address book with the cache selected by `config.cache_size`.
    ///
    /// Must be called within a tokio runtime, which runs the TTL sweeper.
    pub fn new(ds: Arc<D>, config: AddrBookConfig) -> Result<Self, AddrBookError> {
        let cache = new_addr_cache(config.cache_size);
        Self::with_cache(ds, config, cache)
    }

    /// Create an address book with a caller-provided cache strategy.
    pub fn with_cache(
        ds: Arc<D>,
        config: AddrBookConfig,
        cache: Arc<dyn AddrCache>,
    ) -> Result<Self, AddrBookError> {
        config.validate()?;
        let runtime =
            Handle::try_current().map_err(|err| AddrBookError::Runtime(err.to_string()))?;

        let metrics = AddrBookMetrics::default();
        let store = Arc::new(AddrStore::new(ds, config.write_attempts(), metrics.clone()));
        let ttls = Arc::new(TtlIndex::new(Arc::clone(&store), Arc::clone(&cache), metrics.clone()));
        let sweeper = Sweeper::spawn(&runtime, Arc::clone(&ttls), config.ttl_interval);

        Ok(Self {
            config,
            store,
            cache,
            ttls,
            subscriptions: AddrSubscriptions::new(metrics.clone()),
            sweeper,
            metrics,
        })
    }

    pub fn config(&self) -> &AddrBookConfig {
        &self.config
    }

    /// Add a single address. See [`AddressBook::add_addrs`].
    pub fn add_addr(
        &self,
        peer: &PeerId,
        addr: Multiaddr,
        ttl: Duration,
    ) -> Result<(), AddrBookError> {
        self.add_addrs(peer, &[addr], ttl)
    }

    /// Add addresses that are not yet known, or extend the TTL of known ones.
    ///
    /// A zero `ttl` is a no-op. Existing expiries are never shortened. Only
    /// addresses that were not stored before are announced to address streams.
    pub fn add_addrs(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<(), AddrBookError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.write_addrs(peer, addrs, ttl, TtlUpdate::Extend)
    }

    /// Set a single address. See [`AddressBook::set_addrs`].
    pub fn set_addr(
        &self,
        peer: &PeerId,
        addr: Multiaddr,
        ttl: Duration,
    ) -> Result<(), AddrBookError> {
        self.set_addrs(peer, &[addr], ttl)
    }

    /// Store addresses with exactly `ttl`, resetting any previous expiry.
    ///
    /// A zero `ttl` deletes the given addresses instead.
    pub fn set_addrs(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<(), AddrBookError> {
        if ttl.is_zero() {
            return self.delete_addrs(peer, addrs);
        }
        self.write_addrs(peer, addrs, ttl, TtlUpdate::Reset)
    }

    /// Move the peer's addresses tagged `old_ttl` to `new_ttl`, restarting their
    /// expiry. Stored records and the cache are left alone.
    pub fn update_addrs(&self, peer: &PeerId, old_ttl: Duration, new_ttl: Duration) {
        let changed = self.ttls.reclass(&peer_key(peer), old_ttl, new_ttl);
        debug!(%peer, ?old_ttl, ?new_ttl, changed, "updated address ttls");
    }

    /// Known addresses for `peer`. Empty when none are stored or the read fails.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        if let Some(addrs) = self.cache.get(peer) {
            self.metrics.record_cache_lookup(true);
            return addrs;
        }
        self.metrics.record_cache_lookup(false);

        match self.store.query_addrs(&peer_key(peer)) {
            Ok(addrs) => {
                self.cache.add(*peer, addrs.clone());
                addrs
            }
            Err(err) => {
                warn!(%peer, %err, "failed to load addresses");
                Vec::new()
            }
        }
    }

    /// Every peer with at least one stored address. Empty when the read fails.
    pub fn peers_with_addrs(&self) -> HashSet<PeerId> {
        self.store.query_peers().unwrap_or_else(|err| {
            warn!(%err, "failed to list peers with addresses");
            HashSet::new()
        })
    }

    /// Stream the peer's current addresses, then each newly added one, until
    /// `cancel` completes.
    pub fn addr_stream(
        &self,
        peer: &PeerId,
        cancel: impl Future<Output = ()> + Send + 'static,
    ) -> AddrStream {
        let registration = self.subscriptions.register(*peer);
        let initial = self.addrs(peer);
        registration.into_stream(initial, cancel)
    }

    /// Delete every address of `peer`.
    ///
    /// A cached address list, when present, names exactly the records to delete;
    /// otherwise the peer's records are found by a prefix scan.
    pub fn clear_addrs(&self, peer: &PeerId) -> Result<(), AddrBookError> {
        let prefix = peer_key(peer);
        let cached = self.cache.peek(peer);
        self.cache.remove(peer);

        let deleted = match cached {
            Some(addrs) => {
                let (keys, _) = keys_and_addrs(peer, &addrs);
                self.store
                    .with_retries(peer, |store| store.delete(&keys))
                    .map(|()| keys.len())
            }
            None => self
                .store
                .with_retries(peer, |store| store.delete_prefix(&prefix))
                .map(|keys| keys.len()),
        }?;

        self.ttls.clear_prefix(&prefix);
        self.metrics.record_deleted(deleted);
        debug!(%peer, deleted, "cleared addresses");
        Ok(())
    }

    /// Ask the TTL sweeper to stop. Returns without waiting for it.
    pub fn stop(&self) {
        self.sweeper.stop();
    }

    /// Stop the TTL sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.sweeper.shutdown().await;
    }

    /// Run one TTL sweep now. Returns the number of expired records removed.
    pub fn sweep(&self) -> usize {
        self.ttls.sweep()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn write_addrs(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
        update: TtlUpdate,
    ) -> Result<(), AddrBookError> {
        let (keys, addrs) = keys_and_addrs(peer, addrs);
        if keys.is_empty() {
            return Ok(());
        }

        self.cache.remove(peer);
        let existed = self
            .store
            .with_retries(peer, |store| store.insert(&keys, &addrs))?;
        self.metrics.record_insert(&existed);

        for (addr, existed) in addrs.iter().zip(&existed) {
            if !existed {
                self.subscriptions.broadcast(peer, addr);
            }
        }

        let untracked = match update {
            TtlUpdate::Extend => self.ttls.insert_or_extend(&keys, ttl),
            TtlUpdate::Reset => self.ttls.set(&keys, ttl),
        };

        // A record found present but untracked may have been expired by a sweep
        // that committed after our insert; write it again.
        let (keys, addrs): (Vec<Key>, Vec<Multiaddr>) = keys
            .into_iter()
            .zip(addrs)
            .zip(existed)
            .filter(|((key, _), existed)| *existed && untracked.contains(key))
            .map(|(pair, _)| pair)
            .unzip();
        self.restore_swept(peer, keys, addrs)
    }

    fn restore_swept(
        &self,
        peer: &PeerId,
        keys: Vec<Key>,
        addrs: Vec<Multiaddr>,
    ) -> Result<(), AddrBookError> {
        if keys.is_empty() {
            return Ok(());
        }

        let existed = match self
            .store
            .with_retries(peer, |store| store.insert(&keys, &addrs))
        {
            Ok(existed) => existed,
            Err(err) => {
                self.ttls.delete(&keys);
                return Err(err);
            }
        };
        self.cache.remove(peer);

        let mut restored = 0;
        for (addr, existed) in addrs.iter().zip(&existed) {
            if !existed {
                self.subscriptions.broadcast(peer, addr);
                restored += 1;
            }
        }
        if restored > 0 {
            debug!(%peer, restored, "rewrote addresses removed by a concurrent sweep");
        }
        Ok(())
    }

    fn delete_addrs(&self, peer: &PeerId, addrs: &[Multiaddr]) -> Result<(), AddrBookError> {
        let (keys, _) = keys_and_addrs(peer, addrs);
        if keys.is_empty() {
            return Ok(());
        }

        self.cache.remove(peer);
        self.store.with_retries(peer, |store| store.delete(&keys))?;

        self.ttls.delete(&keys);
        self.metrics.record_deleted(keys.len());
        Ok(())
    }
}
