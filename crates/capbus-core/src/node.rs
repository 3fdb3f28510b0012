//! Queue node header.
//!
//! Every queued entity embeds one of these. The stamp word (timestamp +
//! stage flag + node kind) lives in an atomic so the lock-free front hint
//! publication can read a consistent header, but all writes happen under the
//! owning queue's lock. The linked marker is the moral equivalent of an
//! intrusive tree node being attached: it is what a racing commit consults
//! to find out the node was flushed underneath it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use capbus_types::{NodeKind, PeerId, StampWord, Timestamp};

/// Header shared by every queue entry.
#[derive(Debug)]
pub struct QueueNode {
    /// Packed [`StampWord`]; written under the queue lock, readable anywhere.
    stamp: AtomicU64,
    /// Producing peer; used for ordering tie-break only.
    sender: PeerId,
    /// Whether the node currently sits in a queue's ordered set.
    linked: AtomicBool,
    /// Insertion sequence within the owning queue, the final ordering
    /// tie-break for equal (timestamp, sender) keys. Valid while linked.
    seq: AtomicU64,
}

impl QueueNode {
    #[must_use]
    pub fn new(sender: PeerId, kind: NodeKind) -> Self {
        Self {
            stamp: AtomicU64::new(StampWord::unstamped(kind).raw()),
            sender,
            linked: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn sender(&self) -> PeerId {
        self.sender
    }

    /// Current stamp word.
    #[must_use]
    pub fn stamp(&self) -> StampWord {
        StampWord::from_raw(self.stamp.load(Ordering::Acquire))
    }

    /// Current timestamp (zero while unstamped).
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.stamp().timestamp()
    }

    /// Node kind, fixed at construction.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.stamp().kind()
    }

    /// Whether the node carries a staging timestamp.
    #[must_use]
    pub fn is_staging(&self) -> bool {
        self.timestamp().is_staging()
    }

    /// Whether the node is linked into a queue.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Re-stamp the node. Caller holds the owning queue's lock.
    pub(crate) fn set_timestamp(&self, ts: Timestamp) {
        let word = self.stamp().with_timestamp(ts);
        self.stamp.store(word.raw(), Ordering::Release);
    }

    /// Mark linked/unlinked. Caller holds the owning queue's lock.
    pub(crate) fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    pub(crate) fn insertion_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_insertion_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }
}
