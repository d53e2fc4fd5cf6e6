//! Subscription handles for consumers of session data: raw byte chunks for
//! live terminal streaming, and coalesced buffer snapshots for `/buffers`.
//!
//! Two flavors: raw byte-slice subscriptions fed directly from the PTY
//! reader, and buffer-snapshot subscriptions fed by the buffer manager's
//! tailer. Both use bounded channels and drop under back-pressure rather
//! than block their producer.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::buffer::snapshot::BufferSnapshot;
use crate::constants::RAW_SUBSCRIPTION_DEPTH;

/// Sending half of a raw subscription, held by the I/O multiplexer.
#[derive(Clone)]
pub struct RawSender(mpsc::Sender<Bytes>);

/// Receiving half of a raw subscription, held by the consumer (HTTP/SSE/WS handler).
pub struct RawReceiver(mpsc::Receiver<Bytes>);

/// Creates a bounded raw-subscription channel pair.
#[must_use]
pub fn raw_channel() -> (RawSender, RawReceiver) {
    let (tx, rx) = mpsc::channel(RAW_SUBSCRIPTION_DEPTH);
    (RawSender(tx), RawReceiver(rx))
}

impl RawSender {
    /// Sends a chunk without blocking. On a full queue the chunk is dropped
    /// and the drop is logged; the PTY reader must never stall on a slow
    /// subscriber.
    pub fn send(&self, chunk: Bytes) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.0.try_send(chunk) {
            log::warn!("[subscription] raw subscriber queue full, dropping chunk");
        }
    }
}

impl RawReceiver {
    /// Awaits the next chunk, or `None` once the sender side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.0.recv().await
    }
}

/// Sending half of a buffer-snapshot subscription, held by the buffer manager.
///
/// Backed by a `watch` channel: a new snapshot always replaces whatever is
/// pending, which is exactly the coalescing/drop-oldest policy the spec
/// calls for, since every snapshot is a self-contained point-in-time view
/// and a newer one always supersedes an older one a consumer hasn't read yet.
#[derive(Clone)]
pub struct SnapshotSender(tokio::sync::watch::Sender<Option<BufferSnapshot>>);

/// Receiving half of a buffer-snapshot subscription.
pub struct SnapshotReceiver(tokio::sync::watch::Receiver<Option<BufferSnapshot>>);

/// Creates a snapshot-subscription pair with no initial snapshot.
#[must_use]
pub fn snapshot_channel() -> (SnapshotSender, SnapshotReceiver) {
    let (tx, rx) = tokio::sync::watch::channel(None);
    (SnapshotSender(tx), SnapshotReceiver(rx))
}

impl SnapshotSender {
    /// Publishes a snapshot, replacing any snapshot not yet observed.
    pub fn send(&self, snapshot: BufferSnapshot) {
        // A closed receiver just means the subscriber went away; nothing to do.
        let _ = self.0.send(Some(snapshot));
    }
}

impl SnapshotReceiver {
    /// Waits for the next snapshot distinct from the last one observed.
    /// Returns `None` once every sender has been dropped.
    pub async fn recv(&mut self) -> Option<BufferSnapshot> {
        if self.0.changed().await.is_err() {
            return None;
        }
        self.0.borrow_and_update().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_channel_delivers_in_order() {
        let (tx, mut rx) = raw_channel();
        tx.send(Bytes::from_static(b"a"));
        tx.send(Bytes::from_static(b"b"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn raw_channel_drops_oldest_chunk_under_overflow() {
        let (tx, mut rx) = raw_channel();
        for i in 0..(crate::constants::RAW_SUBSCRIPTION_DEPTH + 5) {
            tx.send(Bytes::from(i.to_string()));
        }
        // Draining should not panic or block; the channel is bounded.
        let mut count = 0;
        while rx.0.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= crate::constants::RAW_SUBSCRIPTION_DEPTH);
    }
}
