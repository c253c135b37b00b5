//! Background task driving [`TtlIndex::sweep`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};
use vertex_datastore::TxnDatastore;

use super::TtlIndex;

/// Owned handle to the periodic sweep task.
///
/// The task also exits when the `Sweeper` is dropped.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawn a task on `runtime` that sweeps `index` every `interval`.
    pub fn spawn<D: TxnDatastore>(
        runtime: &Handle,
        index: Arc<TtlIndex<D>>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            let mut shutdown = std::pin::pin!(shutdown_rx);
            debug!(?interval, "ttl sweeper started");

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        debug!("ttl sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let index = Arc::clone(&index);
                        match tokio::task::spawn_blocking(move || index.sweep()).await {
                            Ok(swept) => trace!(swept, "ttl sweep finished"),
                            Err(err) => error!(%err, "ttl sweep task failed"),
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task to stop. Does not wait for it.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Signal the task and wait until it has exited, including any sweep in flight.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(%err, "ttl sweeper exited abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::new_addr_cache;
    use crate::key::{addr_key, peer_key};
    use crate::metrics::AddrBookMetrics;
    use crate::store::AddrStore;
    use libp2p::{Multiaddr, PeerId};
    use vertex_datastore::MemoryDatastore;

    fn test_peer_id(n: u8) -> PeerId {
        let bytes = [n; 32];
        let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes).unwrap();
        let keypair =
            libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(key));
        keypair.public().to_peer_id()
    }

    fn memory_index() -> (Arc<TtlIndex<MemoryDatastore>>, Arc<MemoryDatastore>) {
        let ds = Arc::new(MemoryDatastore::new());
        let metrics = AddrBookMetrics::default();
        let store = Arc::new(AddrStore::new(Arc::clone(&ds), 1, metrics.clone()));
        let index = Arc::new(TtlIndex::new(store, new_addr_cache(0), metrics));
        (index, ds)
    }

    #[tokio::test]
    async fn test_sweeper_expires_records() {
        let (index, ds) = memory_index();
        let peer = test_peer_id(1);
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1634".parse().unwrap();
        let keys = vec![addr_key(&peer_key(&peer), &addr).unwrap()];

        AddrStore::new(Arc::clone(&ds), 1, AddrBookMetrics::default())
            .insert(&keys, &[addr])
            .unwrap();
        index.set(&keys, Duration::from_millis(50));

        let interval = Duration::from_millis(20);
        let sweeper = Sweeper::spawn(&Handle::current(), Arc::clone(&index), interval);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(index.is_empty());
        assert!(ds.is_empty());
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_joins_task() {
        let (index, _ds) = memory_index();
        let sweeper = Sweeper::spawn(&Handle::current(), index, Duration::from_secs(3600));
        assert!(!sweeper.is_finished());

        sweeper.shutdown().await;
        assert!(sweeper.is_finished());

        // Idempotent.
        sweeper.stop();
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let (index, _ds) = memory_index();
        let sweeper = Sweeper::spawn(&Handle::current(), index, Duration::from_secs(3600));
        let handle = sweeper.handle.lock().take().unwrap();

        drop(sweeper);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
