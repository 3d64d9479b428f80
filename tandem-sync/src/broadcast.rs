//! Per-room fan-out of encoded frames to every session but the origin.
//!
//! Uses a tokio broadcast channel, so a send is O(1) regardless of the number
//! of subscribers. Each session owns an independent receiver buffering up to
//! `capacity` frames; a session that falls further behind observes
//! `RecvError::Lagged` and is resynchronized with the full document state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::Frame;

/// Identifies one connection.
pub type SessionId = Uuid;

/// A frame on its way to the other sessions of a room.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Session the frame came from; `Uuid::nil()` for server-originated frames.
    pub origin: SessionId,
    /// Encoded frame, shared by all receivers.
    pub bytes: Arc<Vec<u8>>,
}

impl Relay {
    /// Whether `session` should receive this frame.
    pub fn is_for(&self, session: SessionId) -> bool {
        self.origin != session
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters updated on the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Relay>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before a
    /// slow receiver starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Relay> {
        self.sender.subscribe()
    }

    /// Encode and send `frame` to every receiver. Returns the receiver count.
    pub fn broadcast(&self, origin: SessionId, frame: &Frame) -> usize {
        self.broadcast_raw(origin, Arc::new(frame.encode()))
    }

    /// Send pre-encoded bytes. Receivers filter out their own frames.
    pub fn broadcast_raw(&self, origin: SessionId, bytes: Arc<Vec<u8>>) -> usize {
        let count = self
            .sender
            .send(Relay { origin, bytes })
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
