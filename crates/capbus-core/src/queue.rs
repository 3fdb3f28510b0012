//! Per-peer ordered message queue with the staging/commit protocol.
//!
//! The queue keeps an ordered multiset of messages keyed by
//! (timestamp-with-stage-bit, sender, insertion sequence) and a lock-free
//! *front hint* describing the first readable entry. A message is readable
//! only when it is committed **and** no entry with a smaller key exists, so
//! a staged entry parks every later committed entry behind it until its
//! transaction resolves.
//!
//! All structural mutation happens under one mutex. The front hint is
//! published with a release store and read with acquire loads; readers that
//! observe a stale empty hint simply fall back to a locked re-check.
//!
//! ## Staging protocol
//!
//! Producers `stage` an entry (clock sync + insert with an odd stamp),
//! gather the returned clock values across every destination of the
//! transaction, derive one even commit timestamp greater than all of them,
//! then `commit_staged` each entry. `commit_unstaged` is the unicast fast
//! path that ticks the clock and inserts in one step. `flush` empties the
//! queue, handing committed entries to the caller and invalidating staged
//! entries in place so their transactions observe the removal at commit
//! time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use capbus_error::{BusError, Result};
use capbus_types::Timestamp;

use crate::clock::Clock;
use crate::message::Message;
use crate::waitq::WaitQueue;

/// Front hint bit marking "a readable entry exists".
const HINT_PRESENT: u64 = 1 << 63;

/// Lock-free snapshot of the front entry, for pre-flight sizing only.
///
/// Anyone may race the reader for the actual message, so every decision
/// based on a hint must be re-checked under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontHint {
    /// Descriptor count of the front message at publication time.
    pub n_descriptors: usize,
}

/// Ordering key of a queued entry.
///
/// The stamp carries the stage flag in its low bit, so a staged entry at
/// time T orders after committed T-1 and before committed T+1. Sender
/// breaks timestamp ties; the insertion sequence disambiguates equal
/// (timestamp, sender) pairs the way the original tree walked right on
/// equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    stamp: u64,
    sender: u64,
    seq: u64,
}

struct QueueInner {
    clock: Clock,
    messages: BTreeMap<EntryKey, Arc<Message>>,
    next_seq: u64,
}

/// Ordered per-peer message queue.
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    /// Packed front hint: 0 when no readable entry, otherwise
    /// `HINT_PRESENT | n_descriptors`. Release-published under the lock.
    front: AtomicU64,
    waitq: Arc<WaitQueue>,
}

impl MessageQueue {
    #[must_use]
    pub fn new(waitq: Arc<WaitQueue>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                clock: Clock::new(),
                messages: BTreeMap::new(),
                next_seq: 0,
            }),
            front: AtomicU64::new(0),
            waitq,
        }
    }

    fn key_of(msg: &Message) -> EntryKey {
        EntryKey {
            stamp: msg.node().timestamp().get(),
            sender: msg.node().sender().get(),
            seq: msg.node().insertion_seq(),
        }
    }

    fn front_of(inner: &QueueInner) -> Option<(&EntryKey, &Arc<Message>)> {
        inner
            .messages
            .iter()
            .next()
            .filter(|(key, _)| Timestamp::new(key.stamp).is_some_and(Timestamp::is_committed))
    }

    /// Recompute and publish the front hint; wake readers on the
    /// not-readable to readable edge.
    fn publish_front(&self, inner: &QueueInner, was_readable: bool) {
        let hint = match Self::front_of(inner) {
            Some((_, msg)) => HINT_PRESENT | msg.n_descriptors() as u64,
            None => 0,
        };
        self.front.store(hint, Ordering::Release);
        if !was_readable && hint != 0 {
            tracing::trace!("queue became readable");
            self.waitq.notify_all();
        }
    }

    fn readable_locked(&self) -> bool {
        self.front.load(Ordering::Relaxed) != 0
    }

    /// Link `msg` at `target`, or re-stamp it if already staged.
    ///
    /// The single insertion path shared by stage and both commits, mirroring
    /// the add/update split of the front recomputation rules: validations
    /// first, then unlink/relink at the new key, then front republication.
    fn insert_locked(
        &self,
        inner: &mut QueueInner,
        msg: &Arc<Message>,
        target: Timestamp,
    ) -> Result<()> {
        let node = msg.node();
        let old = node.timestamp();

        // The timestamp must come from this queue's clock window.
        if target.is_unstamped() || target.get() > inner.clock.now().get() + 1 {
            tracing::warn!(
                target = target.get(),
                clock = inner.clock.now().get(),
                "insert with timestamp outside clock window"
            );
            return Err(BusError::Internal("timestamp outside clock window"));
        }
        // Unstamped iff unlinked.
        if old.is_unstamped() == node.is_linked() {
            tracing::warn!(
                timestamp = old.get(),
                linked = node.is_linked(),
                "stamp/link state mismatch"
            );
            return Err(BusError::Internal("stamp/link state mismatch"));
        }
        // A stamped node must be a staged entry moving forward in time.
        if !old.is_unstamped() && (!old.is_staging() || target < old) {
            tracing::warn!(
                old = old.get(),
                target = target.get(),
                "re-stamp of committed node or timestamp decrease"
            );
            return Err(BusError::Internal("node timestamp may only move forward"));
        }
        if old == target {
            return Ok(());
        }

        let was_readable = self.readable_locked();

        // A new entry must never order at or before the current front;
        // committed entries ahead of the front are immutable history.
        if let Some((front_key, front_msg)) = Self::front_of(inner) {
            debug_assert!(!Arc::ptr_eq(front_msg, msg));
            if target.get() <= front_key.stamp {
                tracing::warn!(
                    target = target.get(),
                    front = front_key.stamp,
                    "insert would order at or before the readable front"
                );
                return Err(BusError::Internal("insert would precede the front"));
            }
        }

        if node.is_linked() {
            // Re-stamp: remove at the old key, keep the queue's reference.
            let removed = inner.messages.remove(&Self::key_of(msg));
            debug_assert!(removed.is_some(), "linked node missing from its queue");
        } else {
            node.set_insertion_seq(inner.next_seq);
            inner.next_seq += 1;
            node.set_linked(true);
        }

        node.set_timestamp(target);
        let prev = inner.messages.insert(Self::key_of(msg), Arc::clone(msg));
        debug_assert!(prev.is_none(), "entry key collision");

        self.publish_front(inner, was_readable);
        Ok(())
    }

    /// Stage `msg` with a fresh staging timestamp of at least `min_ts`.
    ///
    /// The staged entry blocks every later timestamp on this queue without
    /// blocking anything already committed. Returns the even clock value the
    /// caller feeds into the transaction-wide maximum; the entry itself is
    /// stamped one above it.
    ///
    /// The queue takes its own reference; the caller keeps theirs.
    pub fn stage(&self, msg: &Arc<Message>, min_ts: Timestamp) -> Result<Timestamp> {
        if min_ts.is_staging() {
            tracing::warn!(min_ts = min_ts.get(), "stage with odd minimum timestamp");
            return Err(BusError::Internal("stage minimum must be even"));
        }
        let mut inner = self.inner.lock();
        let ts = inner.clock.sync(min_ts)?;
        let staged = Timestamp::new(ts.get() + 1).ok_or(BusError::ClockExhausted)?;
        self.insert_locked(&mut inner, msg, staged)?;
        tracing::debug!(
            sender = msg.node().sender().get(),
            stamp = staged.get(),
            "staged queue entry"
        );
        Ok(ts)
    }

    /// Commit a previously staged entry at `ts`.
    ///
    /// Returns `Ok(false)` if the entry is no longer linked (flushed by a
    /// concurrent reset or teardown); the caller must treat the destination
    /// as gone and drop its reference.
    ///
    /// The clock must already have been synced to `ts`; the transaction
    /// driver's sync-all pass guarantees it and this method asserts it.
    pub fn commit_staged(&self, msg: &Arc<Message>, ts: Timestamp) -> Result<bool> {
        if !ts.is_committed() {
            tracing::warn!(ts = ts.get(), "commit with unusable timestamp");
            return Err(BusError::Internal("commit timestamp must be even"));
        }
        let mut inner = self.inner.lock();
        if !msg.node().is_linked() {
            tracing::debug!(
                sender = msg.node().sender().get(),
                "commit of flushed entry skipped"
            );
            return Ok(false);
        }
        assert!(
            inner.clock.now() >= ts,
            "commit at {ts} before clock sync ({})",
            inner.clock.now()
        );
        self.insert_locked(&mut inner, msg, ts)?;
        tracing::debug!(
            sender = msg.node().sender().get(),
            stamp = ts.get(),
            "committed staged entry"
        );
        Ok(true)
    }

    /// Unicast fast path: tick the clock and commit `msg` directly.
    pub fn commit_unstaged(&self, msg: &Arc<Message>) -> Result<Timestamp> {
        let mut inner = self.inner.lock();
        if msg.node().is_linked() {
            tracing::warn!("unstaged commit of an already linked entry");
            return Err(BusError::Internal("unstaged commit of linked node"));
        }
        let ts = inner.clock.tick()?;
        self.insert_locked(&mut inner, msg, ts)?;
        tracing::debug!(
            sender = msg.node().sender().get(),
            stamp = ts.get(),
            "committed unstaged entry"
        );
        Ok(ts)
    }

    /// Unlink `msg` from this queue.
    ///
    /// Returns true iff this call performed the removal. Removing a staged
    /// entry may uncover a committed successor and turn the queue readable.
    pub fn remove(&self, msg: &Arc<Message>) -> bool {
        let mut inner = self.inner.lock();
        if !msg.node().is_linked() {
            return false;
        }
        let was_readable = self.readable_locked();
        let removed = inner.messages.remove(&Self::key_of(msg));
        if removed.is_none() {
            tracing::warn!("linked entry missing from its queue on remove");
            return false;
        }
        msg.node().set_linked(false);
        self.publish_front(&inner, was_readable);
        true
    }

    /// First readable entry, with a continuation marker.
    ///
    /// Returns the front message (an extra reference; the entry stays
    /// queued) and whether the following entry shares its (timestamp,
    /// sender) key, meaning more parts of the same transaction follow.
    #[must_use]
    pub fn peek(&self) -> Option<(Arc<Message>, bool)> {
        let inner = self.inner.lock();
        let mut iter = inner.messages.iter();
        let (key, msg) = iter.next()?;
        if !Timestamp::new(key.stamp).is_some_and(Timestamp::is_committed) {
            return None;
        }
        let continuation = iter
            .next()
            .is_some_and(|(next, _)| next.stamp == key.stamp && next.sender == key.sender);
        Some((Arc::clone(msg), continuation))
    }

    /// Empty the queue.
    ///
    /// Committed entries transfer to the returned list with the queue's
    /// reference, as if dequeued. Staged entries are unlinked in place and
    /// the queue's reference dropped; the owning transaction still holds
    /// its own reference (so ours is never the last) and will observe the
    /// unlink when it tries to commit.
    pub fn flush(&self) -> Vec<Arc<Message>> {
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut inner.messages);
        let mut committed = Vec::new();
        for (key, msg) in drained {
            msg.node().set_linked(false);
            if Timestamp::new(key.stamp).is_some_and(Timestamp::is_staging) {
                debug_assert!(
                    Arc::strong_count(&msg) > 1,
                    "queue reference to a staged entry must not be the last"
                );
            } else {
                committed.push(msg);
            }
        }
        self.front.store(0, Ordering::Release);
        tracing::debug!(committed = committed.len(), "flushed queue");
        committed
    }

    /// Lock-free front snapshot, for pre-flight sizing only.
    ///
    /// Stale empty reads are fine; callers re-check under the lock.
    #[must_use]
    pub fn front_hint(&self) -> Option<FrontHint> {
        let raw = self.front.load(Ordering::Acquire);
        (raw != 0).then_some(FrontHint {
            n_descriptors: (raw & !HINT_PRESENT) as usize,
        })
    }

    /// Whether a committed entry is at the front.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.front.load(Ordering::Acquire) != 0
    }

    /// Raise this queue's clock to at least `at_least`.
    pub fn sync_clock(&self, at_least: Timestamp) -> Result<Timestamp> {
        self.inner.lock().clock.sync(at_least)
    }

    /// Current clock value.
    #[must_use]
    pub fn current_clock(&self) -> Timestamp {
        self.inner.lock().clock.now()
    }

    /// Number of linked entries (staged and committed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageQueue")
            .field("clock", &inner.clock.now().get())
            .field("len", &inner.messages.len())
            .field("readable", &(self.front.load(Ordering::Relaxed) != 0))
            .finish()
    }
}
