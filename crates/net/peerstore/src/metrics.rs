//! Address book metrics

use metrics::{Counter, Gauge};

/// Address book metrics
#[derive(Clone, Debug)]
pub struct AddrBookMetrics {
    /// Addresses newly written to the store
    pub(crate) addrs_added_total: Counter,
    /// Addresses that were already stored when written
    pub(crate) addrs_existing_total: Counter,
    /// Records removed by explicit deletes and clears
    pub(crate) addrs_deleted_total: Counter,
    /// Records removed by the TTL sweep
    pub(crate) addrs_expired_total: Counter,
    /// Failed sweep commits
    pub(crate) sweep_failures_total: Counter,
    /// Retryable write failures
    pub(crate) write_retries_total: Counter,
    /// Writes that gave up
    pub(crate) write_failures_total: Counter,
    pub(crate) cache_hits_total: Counter,
    pub(crate) cache_misses_total: Counter,
    /// Live address streams
    pub(crate) active_subscriptions: Gauge,
}

impl Default for AddrBookMetrics {
    fn default() -> Self {
        Self {
            addrs_added_total: metrics::counter!("peerstore.addr_book.addrs_added_total"),
            addrs_existing_total: metrics::counter!("peerstore.addr_book.addrs_existing_total"),
            addrs_deleted_total: metrics::counter!("peerstore.addr_book.addrs_deleted_total"),
            addrs_expired_total: metrics::counter!("peerstore.addr_book.addrs_expired_total"),
            sweep_failures_total: metrics::counter!("peerstore.addr_book.sweep_failures_total"),
            write_retries_total: metrics::counter!("peerstore.addr_book.write_retries_total"),
            write_failures_total: metrics::counter!("peerstore.addr_book.write_failures_total"),
            cache_hits_total: metrics::counter!("peerstore.addr_book.cache_hits_total"),
            cache_misses_total: metrics::counter!("peerstore.addr_book.cache_misses_total"),
            active_subscriptions: metrics::gauge!("peerstore.addr_book.active_subscriptions"),
        }
    }
}

impl AddrBookMetrics {
    /// Record the outcome of an insert from its per-address existence flags.
    pub(crate) fn record_insert(&self, existed: &[bool]) {
        let existing = existed.iter().filter(|existed| **existed).count() as u64;
        self.addrs_existing_total.increment(existing);
        self.addrs_added_total.increment(existed.len() as u64 - existing);
    }

    pub(crate) fn record_deleted(&self, count: usize) {
        self.addrs_deleted_total.increment(count as u64);
    }

    pub(crate) fn record_expired(&self, count: usize) {
        self.addrs_expired_total.increment(count as u64);
    }

    pub(crate) fn inc_sweep_failures(&self) {
        self.sweep_failures_total.increment(1);
    }

    pub(crate) fn inc_write_retries(&self) {
        self.write_retries_total.increment(1);
    }

    pub(crate) fn inc_write_failures(&self) {
        self.write_failures_total.increment(1);
    }

    pub(crate) fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits_total.increment(1);
        } else {
            self.cache_misses_total.increment(1);
        }
    }

    pub(crate) fn inc_subscriptions(&self) {
        self.active_subscriptions.increment(1.0);
    }

    pub(crate) fn dec_subscriptions(&self) {
        self.active_subscriptions.decrement(1.0);
    }
}
