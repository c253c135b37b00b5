//! Address TTLs: standard TTL classes and the in-memory expiry index.
//!
//! Expiries live only in memory. After a restart every stored address is
//! untracked, and therefore never swept, until it is written again.

mod index;
mod sweeper;

use std::time::Duration;

use web_time::Instant;

pub use index::TtlIndex;
pub use sweeper::Sweeper;

/// Addresses that are assumed valid for a while, e.g. from a DHT lookup.
pub const ADDRESS_TTL: Duration = Duration::from_secs(60 * 60);

/// Short-lived addresses, e.g. received while dialing a peer.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Addresses advertised by a content provider.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses of a peer we were connected to recently.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Our own addresses as observed by other peers.
pub const OWN_OBSERVED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses that never expire.
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Addresses of connected peers. Distinct from [`PERMANENT_ADDR_TTL`] so they can be
/// reclassed on disconnect.
pub const CONNECTED_ADDR_TTL: Duration = Duration::MAX.saturating_sub(Duration::from_nanos(1));

/// TTL class and expiry of one address record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlEntry {
    pub ttl: Duration,
    /// `None` when the expiry lies beyond the clock's range; the record never expires.
    pub expires_at: Option<Instant>,
}

impl TtlEntry {
    pub fn new(ttl: Duration, now: Instant) -> Self {
        Self {
            ttl,
            expires_at: now.checked_add(ttl),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// True if `self` expires strictly after `other`.
    pub fn outlives(&self, other: &TtlEntry) -> bool {
        match (self.expires_at, other.expires_at) {
            (None, Some(_)) => true,
            (Some(ours), Some(theirs)) => ours > theirs,
            _ => false,
        }
    }
}
