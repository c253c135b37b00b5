//! libp2p address book persisted in a transactional datastore.
//!
//! [`AddressBook`] records which [`Multiaddr`](libp2p::Multiaddr)s are known for
//! each [`PeerId`](libp2p::PeerId), each with a TTL. It is assembled from:
//!
//! - [`AddrStore`]: address records in a [`TxnDatastore`](vertex_datastore::TxnDatastore),
//!   with existence-checked inserts and bounded conflict retries.
//! - [`TtlIndex`]: in-memory expiries, swept periodically by a [`Sweeper`] task.
//! - [`AddrCache`]: per-peer read-through cache ([`LruAddrCache`] or [`NoopAddrCache`]).
//! - [`AddrSubscriptions`]: per-peer [`AddrStream`]s of newly discovered addresses.

mod book;
pub mod cache;
mod config;
mod error;
pub mod key;
mod metrics;
mod store;
mod subscriptions;
pub mod ttl;

pub use book::AddressBook;
pub use cache::{AddrCache, CacheStats, LruAddrCache, NoopAddrCache, new_addr_cache};
pub use config::{
    AddrBookConfig, DEFAULT_CACHE_SIZE, DEFAULT_TTL_INTERVAL, DEFAULT_WRITE_RETRIES,
};
pub use error::AddrBookError;
pub use metrics::AddrBookMetrics;
pub use store::AddrStore;
pub use subscriptions::{AddrStream, AddrSubscriptions, Registration};
pub use ttl::{Sweeper, TtlEntry, TtlIndex};
