//! Record keys: `/<peer base58>/<hex murmur3 digest of the address bytes>`.

use std::collections::HashSet;
use std::io::Cursor;

use libp2p::{Multiaddr, PeerId};
use tracing::warn;
use vertex_datastore::Key;

use crate::error::AddrBookError;

/// Parent key of every record belonging to `peer`.
pub fn peer_key(peer: &PeerId) -> Key {
    Key::root().child_string(peer.to_base58())
}

/// Record key for `addr` under `peer_key`.
///
/// The digest is murmur3 x64/128, a fast non-cryptographic hash. The record value
/// carries the canonical address bytes since the digest is not reversible.
pub fn addr_key(peer_key: &Key, addr: &Multiaddr) -> Result<Key, AddrBookError> {
    if addr.is_empty() {
        return Err(AddrBookError::Encoding {
            addr: addr.clone(),
            reason: "empty address".to_string(),
        });
    }

    let bytes = addr.to_vec();
    let digest = murmur3::murmur3_x64_128(&mut Cursor::new(&bytes), 0).map_err(|err| {
        AddrBookError::Encoding {
            addr: addr.clone(),
            reason: err.to_string(),
        }
    })?;

    Ok(peer_key.child_string(hex::encode(digest.to_be_bytes())))
}

/// Peer owning a record key, recovered from the key's parent segment.
pub fn peer_from_key(key: &Key) -> Option<PeerId> {
    key.parent().name().parse().ok()
}

/// Derive record keys for a batch.
///
/// Addresses that fail to encode are logged and dropped; duplicates within the
/// batch collapse to their first occurrence. Keys and addresses stay index-aligned.
pub(crate) fn keys_and_addrs(peer: &PeerId, addrs: &[Multiaddr]) -> (Vec<Key>, Vec<Multiaddr>) {
    let parent = peer_key(peer);
    let mut seen = HashSet::with_capacity(addrs.len());
    let mut keys = Vec::with_capacity(addrs.len());
    let mut clean = Vec::with_capacity(addrs.len());

    for addr in addrs {
        let key = match addr_key(&parent, addr) {
            Ok(key) => key,
            Err(err) => {
                warn!(%peer, %err, "dropping address");
                continue;
            }
        };
        if seen.insert(key.clone()) {
            keys.push(key);
            clean.push(addr.clone());
        }
    }

    (keys, clean)
}
