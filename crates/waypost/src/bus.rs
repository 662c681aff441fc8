//! Replay-latest packet fan-out.
//!
//! One producer (the sink stage), any number of consumers. The bus caches
//! the single most recent envelope so a late subscriber starts from the
//! latest known packet instead of silence, then follows the live feed. Slow
//! subscribers never block the producer: a consumer that falls behind the
//! bounded fan-out buffer skips ahead to the newest packets.

use crate::envelope::Envelope;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Per-subscriber buffer depth. Bounds the backlog a slow subscriber can
/// accumulate before it is skipped ahead; it is not a delivery guarantee.
const FANOUT_CAPACITY: usize = 64;

struct BusInner {
    /// Most recent envelope, replayed to new subscribers
    latest: Mutex<Option<Envelope>>,
    tx: broadcast::Sender<Envelope>,
}

/// Broadcast bus delivering envelopes to all current subscribers and the
/// cached latest envelope to future ones.
#[derive(Clone)]
pub struct PacketBus {
    inner: Arc<BusInner>,
}

impl Default for PacketBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBus {
    /// Create an empty bus with the default fan-out capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(FANOUT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                latest: Mutex::new(None),
                tx,
            }),
        }
    }

    /// Publish an envelope to all subscribers and update the replay cache.
    ///
    /// Never blocks; publishing with no subscribers only refreshes the cache.
    pub fn publish(&self, envelope: Envelope) {
        // Cache update and send happen under the same lock so a concurrent
        // subscriber either replays this envelope or receives it live,
        // never both.
        let mut latest = lock(&self.inner.latest);
        *latest = Some(envelope.clone());
        let _ = self.inner.tx.send(envelope);
    }

    /// Subscribe to the packet stream.
    ///
    /// Safe to call in any server state; the stream is simply quiet until
    /// packets flow.
    pub fn subscribe(&self) -> PacketStream {
        let latest = lock(&self.inner.latest);
        PacketStream {
            replay: latest.clone(),
            rx: self.inner.tx.subscribe(),
        }
    }
}

/// A subscription to the packet stream.
///
/// Yields the cached latest envelope first (if one exists), then every
/// subsequently published envelope in publication order. Dropping the
/// stream unsubscribes.
pub struct PacketStream {
    replay: Option<Envelope>,
    rx: broadcast::Receiver<Envelope>,
}

impl PacketStream {
    /// Receive the next envelope.
    ///
    /// Returns `None` only if the bus itself has been dropped, which does
    /// not happen while the server exists. A subscriber that fell behind
    /// resumes at the oldest retained envelope after logging how many it
    /// missed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.replay.take() {
            return Some(envelope);
        }
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Packet subscriber lagged, skipped {} envelopes", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
