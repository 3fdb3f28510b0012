//! Peer wrapper: lifecycle, resources, and the receive path.
//!
//! A peer starts *new* (no queue, no pool), becomes *connected* once a
//! client connect publishes its [`PeerInfo`] and flips the activation
//! counter, and ends *shutdown* after a disconnect has drained every
//! in-flight operation and torn the info down. Publication and activation
//! happen inside the waitq's critical section so they appear atomic to a
//! concurrent disconnector; no second lifecycle lock exists.
//!
//! The receive path follows the pre-flight pattern: a lock-free front hint
//! sizes the descriptor reservation, the real message is re-checked under
//! the resource lock, and a mismatch reallocates and retries. A message
//! whose descriptor tail cannot be written is dropped, never re-queued, and
//! a delivery-failure notice is committed onto the queue in its stead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use capbus_error::{BusError, Result};
use capbus_types::encoding::append_u32_le;
use capbus_types::{NodeKind, PeerId, RecvFlags, OFFSET_INVALID, POOL_ALIGN};

use crate::active::ActiveCounter;
use crate::message::Message;
use crate::pool::Pool;
use crate::queue::MessageQueue;
use crate::quota::{Quota, QuotaLimits};
use crate::tables::{DescriptorTable, HandleTable};
use crate::waitq::{WaitOutcome, WaitQueue};

/// Resources guarded by the peer lock.
#[derive(Debug)]
pub struct PeerResources {
    pub pool: Pool,
    pub handles: HandleTable,
    pub quota: Quota,
}

/// Everything a connected peer owns.
#[derive(Debug)]
pub struct PeerInfo {
    pool_size: u64,
    queue: MessageQueue,
    resources: Mutex<PeerResources>,
    descriptors: Mutex<DescriptorTable>,
}

impl PeerInfo {
    fn new(waitq: Arc<WaitQueue>, pool_size: u64, limits: QuotaLimits) -> Self {
        Self {
            pool_size,
            queue: MessageQueue::new(waitq),
            resources: Mutex::new(PeerResources {
                pool: Pool::with_size(pool_size),
                handles: HandleTable::new(),
                quota: Quota::new(limits),
            }),
            descriptors: Mutex::new(DescriptorTable::new(limits.max_descriptors)),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    #[must_use]
    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub(crate) fn resources(&self) -> &Mutex<PeerResources> {
        &self.resources
    }

    pub(crate) fn descriptors(&self) -> &Mutex<DescriptorTable> {
        &self.descriptors
    }

    /// Drain queue and pool without disturbing connection identity.
    ///
    /// Committed entries are deallocated, staged entries invalidated in
    /// place (their transactions observe the unlink at commit), the handle
    /// table and quota are zeroed, and the pool keeps only slices still
    /// held by in-flight senders. The clock is not touched.
    fn reset(&self) -> u64 {
        let mut res = self.resources.lock();
        for msg in self.queue.flush() {
            if let Some(slice) = msg.slice() {
                res.pool.deallocate(&slice);
            }
            res.quota.discharge(msg.charge());
        }
        res.pool.flush();
        res.handles.clear();
        res.quota.reset();
        tracing::debug!(pool_size = self.pool_size, "peer reset");
        self.pool_size
    }
}

/// Result of a successful recv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMsg {
    /// Pool offset of the published slice, or [`OFFSET_INVALID`] for a
    /// dropped-message notice.
    pub offset: u64,
    /// Slice size in bytes.
    pub size: u64,
    pub n_handles: u32,
    pub n_fds: u32,
    /// True for a delivery-failure notice.
    pub dropped: bool,
    /// The sender marked the message as expecting no reply.
    pub silent: bool,
    /// Producing peer.
    pub sender: PeerId,
}

impl RecvMsg {
    fn notice(sender: PeerId) -> Self {
        Self {
            offset: OFFSET_INVALID,
            size: 0,
            n_handles: 0,
            n_fds: 0,
            dropped: true,
            silent: false,
            sender,
        }
    }
}

/// An endpoint on the bus.
pub struct Peer {
    id: PeerId,
    waitq: Arc<WaitQueue>,
    active: ActiveCounter,
    info: RwLock<Option<Arc<PeerInfo>>>,
    limits: QuotaLimits,
}

/// An acquired in-flight reference to a connected peer.
///
/// Holds the activation reference (released on drop) plus the published
/// info, so a disconnect cannot tear the peer down underneath the holder.
pub struct PeerRef {
    peer: Arc<Peer>,
    info: Arc<PeerInfo>,
}

impl PeerRef {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer.id
    }

    #[must_use]
    pub fn info(&self) -> &Arc<PeerInfo> {
        &self.info
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        self.peer.active.release(&self.peer.waitq);
    }
}

impl std::fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRef").field("peer", &self.peer.id).finish()
    }
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, limits: QuotaLimits) -> Arc<Self> {
        Arc::new(Self {
            id,
            waitq: Arc::new(WaitQueue::new()),
            active: ActiveCounter::new(),
            info: RwLock::new(None),
            limits,
        })
    }

    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Acquire an in-flight reference for the duration of an operation.
    pub fn acquire(self: &Arc<Self>) -> Result<PeerRef> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        if !self.active.acquire() {
            return Err(BusError::Shutdown);
        }
        match self.info.read().clone() {
            Some(info) => Ok(PeerRef {
                peer: Arc::clone(self),
                info,
            }),
            None => {
                self.active.release(&self.waitq);
                Err(BusError::Shutdown)
            }
        }
    }

    /// Establish a fresh connection with a pool of `pool_size` bytes.
    pub fn connect_client(&self, pool_size: u64) -> Result<u64> {
        if pool_size == 0 || pool_size % POOL_ALIGN != 0 {
            return Err(BusError::InvalidPoolSize { size: pool_size });
        }
        let info = Arc::new(PeerInfo::new(
            Arc::clone(&self.waitq),
            pool_size,
            self.limits,
        ));

        // Publish info and activate inside the waitq critical section so
        // the pair appears atomic to concurrent connects and disconnects.
        let _guard = self.waitq.lock();
        if self.active.is_deactivated() {
            return Err(BusError::Shutdown);
        }
        let mut slot = self.info.write();
        if slot.is_some() {
            return Err(BusError::AlreadyConnected);
        }
        *slot = Some(info);
        if self.active.activate() {
            tracing::debug!(peer = %self.id, pool_size, "peer connected");
            Ok(pool_size)
        } else {
            *slot = None;
            Err(BusError::Shutdown)
        }
    }

    /// Drain queue and pool, keep identity. Returns the pool size.
    pub fn reset(&self) -> Result<u64> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        if !self.active.acquire() {
            return Err(BusError::Shutdown);
        }
        let out = self
            .info
            .read()
            .clone()
            .ok_or(BusError::Shutdown)
            .map(|info| info.reset());
        self.active.release(&self.waitq);
        out
    }

    /// Report the pool size via the read side only.
    pub fn query(&self) -> Result<u64> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        self.info
            .read()
            .as_ref()
            .map(|info| info.pool_size())
            .ok_or(BusError::Shutdown)
    }

    /// Deactivate, drain in-flight operations, and tear down.
    ///
    /// Idempotent: every caller blocks until teardown has finished; exactly
    /// one observes `Ok`, the rest get shutdown.
    pub fn disconnect(&self) -> Result<()> {
        self.active.deactivate();
        // Wake blocked readers so they observe the shutdown.
        self.waitq.notify_all();
        self.active.drain(&self.waitq);
        let torn_down = self.active.cleanup(&self.waitq, || {
            let info = {
                let _guard = self.waitq.lock();
                self.info.write().take()
            };
            if let Some(info) = info {
                info.reset();
            }
            tracing::debug!(peer = %self.id, "peer torn down");
        });
        if torn_down { Ok(()) } else { Err(BusError::Shutdown) }
    }

    /// Block until the queue is readable, the peer shuts down, or `timeout`
    /// expires (reported as would-block, the wait's cancelled status).
    pub fn wait_readable(&self, timeout: Duration) -> Result<()> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        let outcome = self.waitq.wait_until_timeout(
            || {
                self.active.is_deactivated()
                    || self
                        .info
                        .read()
                        .as_ref()
                        .map_or(true, |info| info.queue.is_readable())
            },
            timeout,
        );
        match outcome {
            WaitOutcome::TimedOut => Err(BusError::WouldBlock),
            WaitOutcome::Ready if self.active.is_deactivated() => Err(BusError::Shutdown),
            WaitOutcome::Ready => Ok(()),
        }
    }

    /// Receive the front message, or peek at it without dequeuing.
    pub fn recv(self: &Arc<Self>, flags: RecvFlags) -> Result<RecvMsg> {
        let peer_ref = self.acquire()?;
        let info = Arc::clone(peer_ref.info());

        // Lock-free pre-flight: bail out early on an empty queue and size
        // the descriptor reservation. Anyone might race us for the message,
        // so everything is re-checked under the lock below.
        let Some(hint) = info.queue.front_hint() else {
            return Err(BusError::WouldBlock);
        };

        if flags.peek {
            return Self::peek_front(&info);
        }
        Self::dequeue_front(&info, hint.n_descriptors)
    }

    /// Release a previously published slice back to the pool.
    pub fn slice_release(self: &Arc<Self>, offset: u64) -> Result<()> {
        let peer_ref = self.acquire()?;
        let mut res = peer_ref.info().resources.lock();
        res.pool.release_user(offset)
    }

    /// Copy the bytes of a slice out of the pool (the stand-in for the
    /// receiver's shared-memory mapping).
    pub fn read_slice(self: &Arc<Self>, offset: u64, size: u64) -> Result<Vec<u8>> {
        let peer_ref = self.acquire()?;
        let res = peer_ref.info().resources.lock();
        res.pool
            .read(&crate::pool::SliceRef { offset, size })
            .map(<[u8]>::to_vec)
    }

    /// Resolve an installed descriptor number to its transferred value.
    pub fn descriptor_value(self: &Arc<Self>, number: u32) -> Result<Option<u32>> {
        let peer_ref = self.acquire()?;
        let value = peer_ref.info().descriptors.lock().get(number);
        Ok(value)
    }

    fn peek_front(info: &Arc<PeerInfo>) -> Result<RecvMsg> {
        let mut res = info.resources.lock();
        let Some((msg, _continuation)) = info.queue.peek() else {
            return Err(BusError::WouldBlock);
        };
        if msg.kind() == NodeKind::Notice {
            // Keep the notice queued; a non-PEEK recv consumes it.
            return Ok(RecvMsg::notice(msg.sender()));
        }
        let slice = msg
            .slice()
            .ok_or(BusError::Internal("message without slice"))?;
        let (offset, size) = res.pool.publish(&slice)?;
        Ok(RecvMsg {
            offset,
            size,
            n_handles: msg.n_handles(),
            n_fds: u32::try_from(msg.n_descriptors()).unwrap_or(u32::MAX),
            dropped: false,
            silent: msg.flags().silent,
            sender: msg.sender(),
        })
    }

    fn dequeue_front(info: &Arc<PeerInfo>, mut wanted: usize) -> Result<RecvMsg> {
        let mut reserved: Vec<u32> = Vec::new();

        // Reserve descriptors outside the peer lock, re-check the front
        // under it, and retry until the reservation covers the message.
        let (msg, mut res) = loop {
            if wanted > reserved.len() {
                let mut fds = info.descriptors.lock();
                match fds.reserve(wanted - reserved.len()) {
                    Ok(mut more) => reserved.append(&mut more),
                    Err(err) => {
                        fds.unreserve(&reserved);
                        drop(fds);
                        Self::drop_front_message(info);
                        return Err(err);
                    }
                }
            }

            let res = info.resources.lock();
            match info.queue.peek() {
                None => {
                    drop(res);
                    info.descriptors.lock().unreserve(&reserved);
                    return Err(BusError::WouldBlock);
                }
                Some((msg, _)) if msg.kind() == NodeKind::Notice => {
                    info.queue.remove(&msg);
                    drop(res);
                    info.descriptors.lock().unreserve(&reserved);
                    return Ok(RecvMsg::notice(msg.sender()));
                }
                Some((msg, _)) if msg.n_descriptors() > reserved.len() => {
                    // A different message raced to the front; grow and retry.
                    wanted = msg.n_descriptors();
                    drop(res);
                }
                Some((msg, _)) => {
                    info.queue.remove(&msg);
                    break (msg, res);
                }
            }
        };

        let slice = msg
            .slice()
            .ok_or(BusError::Internal("message without slice"))?;
        let (offset, size) = res.pool.publish(&slice)?;
        let n_fds = msg.n_descriptors();

        if n_fds == 0 {
            res.pool.deallocate(&slice);
            res.quota.discharge(msg.charge());
            drop(res);
            info.descriptors.lock().unreserve(&reserved);
            return Ok(RecvMsg {
                offset,
                size,
                n_handles: msg.n_handles(),
                n_fds: 0,
                dropped: false,
                silent: msg.flags().silent,
                sender: msg.sender(),
            });
        }

        // Write the receiver-visible descriptor numbers into the slice
        // tail, then drop the kernel reference either way: on failure the
        // message is gone for good (re-queueing would break ordering).
        let mut tail = Vec::with_capacity(n_fds * 4);
        for number in &reserved[..n_fds] {
            append_u32_le(&mut tail, *number);
        }
        let tail_at = size - tail.len() as u64;
        let written = res.pool.write_vecs(&slice, tail_at, &[&tail]);
        res.pool.deallocate(&slice);
        res.quota.discharge(msg.charge());

        match written {
            Ok(()) => {
                drop(res);
                let mut fds = info.descriptors.lock();
                fds.unreserve(&reserved[n_fds..]);
                for (number, value) in reserved[..n_fds].iter().zip(msg.descriptors()) {
                    fds.install(*number, *value)?;
                }
                Ok(RecvMsg {
                    offset,
                    size,
                    n_handles: msg.n_handles(),
                    n_fds: u32::try_from(n_fds).unwrap_or(u32::MAX),
                    dropped: false,
                    silent: msg.flags().silent,
                    sender: msg.sender(),
                })
            }
            Err(err) => {
                // Take the publication back; the caller never learns the
                // offset of a dropped message.
                let _ = res.pool.release_user(offset);
                drop(res);
                info.descriptors.lock().unreserve(&reserved);
                let notice = Message::new_notice(msg.sender());
                let _ = info.queue.commit_unstaged(&notice);
                tracing::warn!(sender = %msg.sender(), "message dropped on tail write failure");
                Err(err)
            }
        }
    }

    /// Drop whatever message is at the front after a descriptor reservation
    /// failure, leaving a notice behind. The front may have changed since
    /// the failed reservation; the policy applies to the current front.
    fn drop_front_message(info: &Arc<PeerInfo>) {
        let mut res = info.resources.lock();
        let Some((msg, _)) = info.queue.peek() else {
            return;
        };
        if msg.kind() == NodeKind::Notice {
            return;
        }
        info.queue.remove(&msg);
        if let Some(slice) = msg.slice() {
            res.pool.deallocate(&slice);
        }
        res.quota.discharge(msg.charge());
        drop(res);
        let notice = Message::new_notice(msg.sender());
        let _ = info.queue.commit_unstaged(&notice);
        tracing::warn!(sender = %msg.sender(), "message dropped on descriptor exhaustion");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("new", &self.active.is_new())
            .field("deactivated", &self.active.is_deactivated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn peer_id(raw: u64) -> PeerId {
        PeerId::new(raw).unwrap()
    }

    fn connected_peer(raw: u64) -> Arc<Peer> {
        let peer = Peer::new(peer_id(raw), QuotaLimits::default());
        peer.connect_client(4096).unwrap();
        peer
    }

    #[test]
    fn connect_validates_pool_size() {
        let peer = Peer::new(peer_id(1), QuotaLimits::default());
        assert_eq!(
            peer.connect_client(0),
            Err(BusError::InvalidPoolSize { size: 0 })
        );
        assert_eq!(
            peer.connect_client(100),
            Err(BusError::InvalidPoolSize { size: 100 })
        );
        assert_eq!(peer.connect_client(8192), Ok(8192));
        assert_eq!(peer.connect_client(4096), Err(BusError::AlreadyConnected));
    }

    #[test]
    fn lifecycle_errors_by_state() {
        let peer = Peer::new(peer_id(1), QuotaLimits::default());
        assert_eq!(peer.query(), Err(BusError::NotConnected));
        assert_eq!(peer.reset(), Err(BusError::NotConnected));
        assert_eq!(peer.recv(RecvFlags::default()), Err(BusError::NotConnected));

        peer.connect_client(4096).unwrap();
        assert_eq!(peer.query(), Ok(4096));
        assert_eq!(peer.recv(RecvFlags::default()), Err(BusError::WouldBlock));

        peer.disconnect().unwrap();
        assert_eq!(peer.query(), Err(BusError::Shutdown));
        assert_eq!(peer.reset(), Err(BusError::Shutdown));
        assert_eq!(peer.recv(RecvFlags::default()), Err(BusError::Shutdown));
        assert_eq!(peer.connect_client(4096), Err(BusError::Shutdown));
    }

    #[test]
    fn disconnect_is_idempotent_across_threads() {
        let peer = connected_peer(1);
        let mut workers = Vec::new();
        for _ in 0..6 {
            let peer = Arc::clone(&peer);
            workers.push(thread::spawn(move || peer.disconnect()));
        }
        let outcomes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let wins = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(
            outcomes
                .iter()
                .filter(|o| o.is_err())
                .all(|o| *o == Err(BusError::Shutdown))
        );
    }

    #[test]
    fn wait_readable_times_out_and_observes_shutdown() {
        let peer = connected_peer(1);
        assert_eq!(
            peer.wait_readable(Duration::from_millis(20)),
            Err(BusError::WouldBlock)
        );

        let waiter = {
            let peer = Arc::clone(&peer);
            thread::spawn(move || peer.wait_readable(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        peer.disconnect().unwrap();
        assert_eq!(waiter.join().unwrap(), Err(BusError::Shutdown));
    }

    #[test]
    fn reset_preserves_identity() {
        let peer = connected_peer(1);
        assert_eq!(peer.reset(), Ok(4096));
        assert_eq!(peer.query(), Ok(4096));
    }
}
