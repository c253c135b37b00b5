//! Per-peer address stream fan-out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::metrics::AddrBookMetrics;

#[derive(Debug)]
struct Sink {
    id: u64,
    tx: mpsc::UnboundedSender<Multiaddr>,
}

#[derive(Debug, Default)]
struct Inner {
    sinks: Mutex<HashMap<PeerId, Vec<Sink>>>,
    next_id: AtomicU64,
}

/// Registry of live address streams, keyed by peer.
///
/// Broadcasts never block: each stream has its own unbounded queue.
#[derive(Debug, Clone)]
pub struct AddrSubscriptions {
    inner: Arc<Inner>,
    metrics: AddrBookMetrics,
}

impl Default for AddrSubscriptions {
    fn default() -> Self {
        Self::new(AddrBookMetrics::default())
    }
}

impl AddrSubscriptions {
    pub fn new(metrics: AddrBookMetrics) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            metrics,
        }
    }

    /// Start buffering broadcasts for `peer`.
    ///
    /// Registering before taking a snapshot of the peer's addresses and then calling
    /// [`Registration::into_stream`] closes the gap between the two.
    pub fn register(&self, peer: PeerId) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .sinks
            .lock()
            .entry(peer)
            .or_default()
            .push(Sink { id, tx });
        self.metrics.inc_subscriptions();
        trace!(%peer, id, "address stream registered");

        Registration {
            rx,
            guard: SinkGuard {
                inner: Arc::clone(&self.inner),
                metrics: self.metrics.clone(),
                peer,
                id,
            },
        }
    }

    /// Stream `initial` followed by every later broadcast for `peer`, until `cancel`
    /// completes or the stream is dropped.
    pub fn subscribe(
        &self,
        peer: PeerId,
        initial: Vec<Multiaddr>,
        cancel: impl Future<Output = ()> + Send + 'static,
    ) -> AddrStream {
        self.register(peer).into_stream(initial, cancel)
    }

    /// Deliver `addr` to every live stream for `peer`. Closed streams are pruned.
    pub fn broadcast(&self, peer: &PeerId, addr: &Multiaddr) {
        let mut sinks = self.inner.sinks.lock();
        let Some(peer_sinks) = sinks.get_mut(peer) else {
            return;
        };

        peer_sinks.retain(|sink| sink.tx.send(addr.clone()).is_ok());
        if peer_sinks.is_empty() {
            sinks.remove(peer);
        }
    }

    /// Number of live streams for `peer`.
    pub fn subscriber_count(&self, peer: &PeerId) -> usize {
        self.inner.sinks.lock().get(peer).map_or(0, Vec::len)
    }
}

/// Removes its sink from the registry when dropped.
#[derive(Debug)]
struct SinkGuard {
    inner: Arc<Inner>,
    metrics: AddrBookMetrics,
    peer: PeerId,
    id: u64,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let mut sinks = self.inner.sinks.lock();
        if let Some(peer_sinks) = sinks.get_mut(&self.peer) {
            peer_sinks.retain(|sink| sink.id != self.id);
            if peer_sinks.is_empty() {
                sinks.remove(&self.peer);
            }
        }
        self.metrics.dec_subscriptions();
        trace!(peer = %self.peer, id = self.id, "address stream removed");
    }
}

/// A registered sink that has not been turned into a stream yet.
#[derive(Debug)]
pub struct Registration {
    rx: mpsc::UnboundedReceiver<Multiaddr>,
    guard: SinkGuard,
}

impl Registration {
    pub fn into_stream(
        self,
        initial: Vec<Multiaddr>,
        cancel: impl Future<Output = ()> + Send + 'static,
    ) -> AddrStream {
        AddrStream {
            seen: initial.iter().cloned().collect(),
            initial: initial.into(),
            rx: self.rx,
            cancel: Box::pin(cancel),
            guard: Some(self.guard),
        }
    }
}

/// Addresses for one peer: the snapshot taken at subscribe time, then live additions.
///
/// Each distinct address is yielded at most once. The stream ends as soon as the
/// cancellation future completes; nothing is yielded after that.
pub struct AddrStream {
    initial: VecDeque<Multiaddr>,
    seen: HashSet<Multiaddr>,
    rx: mpsc::UnboundedReceiver<Multiaddr>,
    cancel: Pin<Box<dyn Future<Output = ()> + Send>>,
    guard: Option<SinkGuard>,
}

impl std::fmt::Debug for AddrStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrStream")
            .field("pending_initial", &self.initial.len())
            .field("closed", &self.guard.is_none())
            .finish_non_exhaustive()
    }
}

impl AddrStream {
    fn close(&mut self) {
        self.guard = None;
        self.initial.clear();
        self.rx.close();
    }
}

impl Stream for AddrStream {
    type Item = Multiaddr;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Multiaddr>> {
        let this = &mut *self;
        if this.guard.is_none() {
            return Poll::Ready(None);
        }

        if this.cancel.as_mut().poll(cx).is_ready() {
            this.close();
            return Poll::Ready(None);
        }

        if let Some(addr) = this.initial.pop_front() {
            return Poll::Ready(Some(addr));
        }

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(addr)) => {
                    if this.seen.insert(addr.clone()) {
                        return Poll::Ready(Some(addr));
                    }
                }
                Poll::Ready(None) => {
                    this.close();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::sync::oneshot;

    use super::*;

    fn test_peer_id(n: u8) -> PeerId {
        let bytes = [n; 32];
        let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes).unwrap();
        let keypair =
            libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(key));
        keypair.public().to_peer_id()
    }

    fn addr(n: u8) -> Multiaddr {
        format!("/ip4/127.0.0.{n}/tcp/1634").parse().unwrap()
    }

    fn cancel_pair() -> (oneshot::Sender<()>, impl Future<Output = ()> + Send + 'static) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
        })
    }

    async fn next(stream: &mut AddrStream) -> Option<Multiaddr> {
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_initial_then_live() {
        let subs = AddrSubscriptions::default();
        let peer = test_peer_id(1);
        let mut stream = subs.subscribe(peer, vec![addr(1), addr(2)], std::future::pending());

        subs.broadcast(&peer, &addr(3));

        assert_eq!(next(&mut stream).await, Some(addr(1)));
        assert_eq!(next(&mut stream).await, Some(addr(2)));
        assert_eq!(next(&mut stream).await, Some(addr(3)));
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_duplicates_suppressed() {
        let subs = AddrSubscriptions::default();
        let peer = test_peer_id(1);
        let registration = subs.register(peer);

        // Committed between registration and snapshot: broadcast and in the snapshot.
        subs.broadcast(&peer, &addr(1));
        let mut stream = registration.into_stream(vec![addr(1)], std::future::pending());
        subs.broadcast(&peer, &addr(2));
        subs.broadcast(&peer, &addr(2));

        assert_eq!(next(&mut stream).await, Some(addr(1)));
        assert_eq!(next(&mut stream).await, Some(addr(2)));
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_peer() {
        let subs = AddrSubscriptions::default();
        let p1 = test_peer_id(1);
        let p2 = test_peer_id(2);
        let mut s1 = subs.subscribe(p1, Vec::new(), std::future::pending());
        let mut s2a = subs.subscribe(p2, Vec::new(), std::future::pending());
        let mut s2b = subs.subscribe(p2, Vec::new(), std::future::pending());

        subs.broadcast(&p2, &addr(1));

        assert_eq!(next(&mut s1).await, None);
        assert_eq!(next(&mut s2a).await, Some(addr(1)));
        assert_eq!(next(&mut s2b).await, Some(addr(1)));
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_unregisters() {
        let subs = AddrSubscriptions::default();
        let peer = test_peer_id(1);
        let (cancel_tx, cancel) = cancel_pair();
        let mut stream = subs.subscribe(peer, vec![addr(1)], cancel);
        assert_eq!(subs.subscriber_count(&peer), 1);

        assert_eq!(next(&mut stream).await, Some(addr(1)));
        subs.broadcast(&peer, &addr(2));
        cancel_tx.send(()).unwrap();

        // Queued but undelivered items are dropped on cancel.
        assert_eq!(stream.next().await, None);
        assert_eq!(subs.subscriber_count(&peer), 0);

        subs.broadcast(&peer, &addr(3));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let subs = AddrSubscriptions::default();
        let peer = test_peer_id(1);

        let stream = subs.subscribe(peer, Vec::new(), std::future::pending());
        let registration = subs.register(peer);
        assert_eq!(subs.subscriber_count(&peer), 2);

        drop(stream);
        drop(registration);
        assert_eq!(subs.subscriber_count(&peer), 0);

        // Broadcasting to a peer without streams is a no-op.
        subs.broadcast(&peer, &addr(1));
    }
}
