//! Transaction driver: one commit timestamp across every destination.
//!
//! A multicast send stages one message per destination queue, derives a
//! single even commit timestamp strictly greater than every clock value
//! observed across the destinations, syncs every clock to it, and only then
//! commits. That order gives the causality guarantee: any message sent
//! after observing a delivery at T receives a timestamp above T on every
//! destination.
//!
//! Failures partition per destination. A commit on one queue is never
//! rolled back because another destination disappeared; the failed
//! destination is reported and its entry discarded.

use std::sync::Arc;

use smallvec::SmallVec;

use capbus_error::{BusError, Result};
use capbus_types::encoding::append_u64_le;
use capbus_types::{PeerId, SendFlags, Timestamp};

use crate::message::{Message, MessageCharge};
use crate::peer::{Peer, PeerInfo};

/// Per-destination delivery outcome.
pub type DestinationResult = (PeerId, Result<()>);

/// Outcome of a send across all destinations.
#[derive(Debug, Default)]
pub struct SendReport {
    pub destinations: SmallVec<[DestinationResult; 4]>,
}

impl SendReport {
    /// Whether every destination accepted the message.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.destinations.iter().all(|(_, r)| r.is_ok())
    }

    /// The single result of a unicast send.
    #[must_use]
    pub fn unicast_result(&self) -> Option<&Result<()>> {
        match self.destinations.as_slice() {
            [(_, result)] => Some(result),
            _ => None,
        }
    }
}

struct TxnEntry {
    dest_id: PeerId,
    /// Kept alive across the stage/commit window even if the peer is torn
    /// down meanwhile; a commit then observes the flushed unlink instead of
    /// touching freed state. The destination's activation reference is held
    /// only inside each operation, so a disconnect never waits on a live
    /// stager.
    info: Arc<PeerInfo>,
    msg: Arc<Message>,
    /// Even clock value returned by stage; `None` on the unicast fast path.
    staged_at: Option<Timestamp>,
}

impl TxnEntry {
    /// Unlink and deallocate a message that will not be delivered.
    fn discard(&self) {
        self.info.queue().remove(&self.msg);
        if let Some(slice) = self.msg.slice() {
            let mut res = self.info.resources().lock();
            res.pool.deallocate(&slice);
            res.quota.discharge(self.msg.charge());
        }
    }
}

/// A send in flight: instantiated messages not yet committed.
///
/// Dropping an uncommitted transaction cancels it: staged entries are
/// removed from their queues and their slices returned.
pub struct Transaction {
    sender: PeerId,
    flags: SendFlags,
    entries: SmallVec<[TxnEntry; 4]>,
}

impl Transaction {
    #[must_use]
    pub fn new(sender: PeerId, flags: SendFlags) -> Self {
        Self {
            sender,
            flags,
            entries: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    /// Materialise the message on `dest`: charge quota, allocate and fill
    /// the slice, import handles, and (for multicast) stage the entry.
    ///
    /// Slice layout: payload vectors back to back, then one little-endian
    /// u64 per imported handle id. The descriptor tail stays unwritten
    /// until dequeue.
    pub fn instantiate(
        &mut self,
        dest: &Arc<Peer>,
        vecs: &[&[u8]],
        handles: &[u64],
        descriptors: &[u32],
        stage: bool,
    ) -> Result<()> {
        let dest_ref = dest.acquire()?;
        let info = Arc::clone(dest_ref.info());

        let payload_len: u64 = vecs.iter().map(|v| v.len() as u64).sum();
        let size = payload_len + 8 * handles.len() as u64 + 4 * descriptors.len() as u64;
        let charge = MessageCharge {
            bytes: size,
            slices: 1,
            handles: u32::try_from(handles.len()).map_err(|_| BusError::QuotaExceeded {
                what: "handles",
            })?,
            descriptors: u32::try_from(descriptors.len()).map_err(|_| {
                BusError::QuotaExceeded {
                    what: "descriptors",
                }
            })?,
        };

        let msg = {
            let mut res = info.resources().lock();
            res.quota.charge(charge)?;
            let slice = match res.pool.alloc(size) {
                Ok(slice) => slice,
                Err(err) => {
                    res.quota.discharge(charge);
                    return Err(err);
                }
            };

            let mut written = res.pool.write_vecs(&slice, 0, vecs);
            if written.is_ok() && !handles.is_empty() {
                let mut ids = Vec::with_capacity(handles.len() * 8);
                for value in handles {
                    let id = res.handles.import(self.sender, *value);
                    append_u64_le(&mut ids, id.get());
                }
                written = res.pool.write_vecs(&slice, payload_len, &[&ids]);
            }
            if let Err(err) = written {
                res.pool.deallocate(&slice);
                res.quota.discharge(charge);
                return Err(err);
            }

            Message::new(
                self.sender,
                slice,
                charge.handles,
                descriptors.to_vec(),
                self.flags,
            )
        };

        let staged_at = if stage {
            match info.queue().stage(&msg, Timestamp::ZERO) {
                Ok(ts) => Some(ts),
                Err(err) => {
                    let mut res = info.resources().lock();
                    if let Some(slice) = msg.slice() {
                        res.pool.deallocate(&slice);
                    }
                    res.quota.discharge(charge);
                    return Err(err);
                }
            }
        } else {
            None
        };

        drop(dest_ref);
        self.entries.push(TxnEntry {
            dest_id: dest.id(),
            info,
            msg,
            staged_at,
        });
        Ok(())
    }

    /// Commit every staged entry with one transaction-wide timestamp.
    ///
    /// Three passes: take the maximum over the stage returns, raise every
    /// destination clock to it while collecting the largest clock actually
    /// observed, then sync-all and commit-all at two above that maximum.
    pub fn commit(mut self) -> SmallVec<[DestinationResult; 4]> {
        let entries = std::mem::take(&mut self.entries);
        let mut results = SmallVec::new();

        let mut max = Timestamp::ZERO;
        for entry in &entries {
            debug_assert!(entry.staged_at.is_some(), "multicast commit of unstaged entry");
            if let Some(ts) = entry.staged_at {
                if ts > max {
                    max = ts;
                }
            }
        }

        // Clock acquisition: after this pass `max` is >= every destination
        // clock, hence strictly below the commit timestamp chosen next.
        let mut sync_failed = false;
        for entry in &entries {
            match entry.info.queue().sync_clock(max) {
                Ok(clock) => {
                    if clock > max {
                        max = clock;
                    }
                }
                Err(_) => sync_failed = true,
            }
        }
        let commit_at = Timestamp::new(max.get() + 2).filter(|_| !sync_failed);
        let Some(commit_at) = commit_at else {
            // Clock exhaustion anywhere poisons the transaction; nothing
            // has been committed yet, so discard everything.
            for entry in &entries {
                entry.discard();
                results.push((entry.dest_id, Err(BusError::ClockExhausted)));
            }
            return results;
        };

        tracing::debug!(
            sender = %self.sender,
            commit_at = commit_at.get(),
            destinations = entries.len(),
            "committing transaction"
        );

        for entry in entries {
            let queue = entry.info.queue();
            let outcome = queue
                .sync_clock(commit_at)
                .and_then(|_| queue.commit_staged(&entry.msg, commit_at))
                .and_then(|committed| {
                    if committed {
                        Ok(())
                    } else {
                        // Flushed by a concurrent reset or teardown: the
                        // destination is gone for this delivery.
                        Err(BusError::Shutdown)
                    }
                });
            if outcome.is_err() {
                entry.discard();
            }
            results.push((entry.dest_id, outcome));
        }
        results
    }

    /// Unicast fast path: tick the destination clock and commit directly.
    pub fn commit_unicast(mut self) -> Result<()> {
        let mut entries = std::mem::take(&mut self.entries);
        debug_assert_eq!(entries.len(), 1, "unicast commit with multiple entries");
        let Some(entry) = entries.pop() else {
            return Err(BusError::Internal("unicast commit without entry"));
        };
        debug_assert!(entry.staged_at.is_none(), "unicast commit of staged entry");

        match entry.info.queue().commit_unstaged(&entry.msg) {
            Ok(ts) => {
                tracing::debug!(
                    sender = %self.sender,
                    dest = %entry.dest_id,
                    commit_at = ts.get(),
                    "committed unicast"
                );
                Ok(())
            }
            Err(err) => {
                entry.discard();
                Err(err)
            }
        }
    }

    /// Cancel every instantiated entry.
    pub fn cancel(mut self) {
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            entry.discard();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.discard();
        }
    }
}
