//! The bus: peer registry and caller-facing request surface.
//!
//! The bus owns the peer map and the id counter. Every request is decoded
//! and validated here, then routed to the peer wrapper or the transaction
//! driver; the queue core never sees raw flag words.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use capbus_core::{Peer, QuotaLimits, RecvMsg, SendReport, Transaction};
use capbus_error::{BusError, Result};
use capbus_types::{ConnectMode, PeerId, RecvFlags, SendFlags, FD_MAX, VEC_MAX};

/// Bus-wide configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BusConfig {
    /// Quota ceilings applied to every peer on this bus.
    pub quota: QuotaLimits,
}

/// A send request as handed in by a caller.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    pub destinations: &'a [PeerId],
    /// Raw send flag word; validated here.
    pub flags: u64,
    /// Payload vectors, copied back to back into each destination slice.
    pub vecs: &'a [&'a [u8]],
    /// Capability values to transfer.
    pub handles: &'a [u64],
    /// Descriptor values to transfer.
    pub descriptors: &'a [u32],
}

/// A local IPC bus.
pub struct Bus {
    config: BusConfig,
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    ids: AtomicU64,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            ids: AtomicU64::new(0),
        }
    }

    /// Create a peer in the *new* (unconnected) state and return its id.
    pub fn create_peer(&self) -> PeerId {
        let raw = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let id = PeerId::new(raw).expect("peer id counter starts at 1");
        let peer = Peer::new(id, self.config.quota);
        self.peers.write().insert(raw, peer);
        tracing::debug!(peer = %id, "peer created");
        id
    }

    /// Look up a peer by id.
    pub fn peer(&self, id: PeerId) -> Result<Arc<Peer>> {
        self.peers
            .read()
            .get(&id.get())
            .cloned()
            .ok_or(BusError::InvalidArgument {
                detail: "unknown peer id",
            })
    }

    /// Connect request: client setup, reset, or query, selected by flags.
    ///
    /// Returns the pool size (the accepted size for client, the existing
    /// size for reset and query).
    pub fn connect(&self, id: PeerId, flags: u64, pool_size: u64) -> Result<u64> {
        let mode = ConnectMode::from_flags(flags)
            .map_err(|bad| BusError::InvalidFlags { flags: bad.flags })?;
        let peer = self.peer(id)?;
        match mode {
            ConnectMode::Client => peer.connect_client(pool_size),
            ConnectMode::Reset => {
                if pool_size != 0 {
                    return Err(BusError::InvalidPoolSize { size: pool_size });
                }
                peer.reset()
            }
            ConnectMode::Query => {
                if pool_size != 0 {
                    return Err(BusError::InvalidPoolSize { size: pool_size });
                }
                peer.query()
            }
        }
    }

    /// Send a message from `sender` to every destination in the request.
    ///
    /// Top-level errors cover request validation and the sender's own
    /// state; everything destination-specific lands in the report, and a
    /// successful commit on one destination is never rolled back because
    /// another failed.
    pub fn send(&self, sender: PeerId, req: &SendRequest<'_>) -> Result<SendReport> {
        let flags = SendFlags::from_bits(req.flags)
            .map_err(|bad| BusError::InvalidFlags { flags: bad.flags })?;
        if req.vecs.len() > VEC_MAX {
            return Err(BusError::TooManyVectors {
                count: req.vecs.len(),
                max: VEC_MAX,
            });
        }
        if req.descriptors.len() > FD_MAX {
            return Err(BusError::TooManyDescriptors {
                count: req.descriptors.len(),
                max: FD_MAX,
            });
        }
        if req.destinations.is_empty() {
            return Err(BusError::InvalidArgument {
                detail: "empty destination set",
            });
        }
        if flags.release_handles {
            // Handle release is the sending side's bookkeeping; transferred
            // values stay valid at the receiver either way.
            tracing::debug!(sender = %sender, "send with handle release");
        }

        let sender_peer = self.peer(sender)?;
        // The sender holds an in-flight reference for the whole send.
        let sender_ref = sender_peer.acquire()?;

        let mut report = SendReport::default();
        let mut txn = Transaction::new(sender, flags);

        if let [dest] = req.destinations {
            // Unicast fast path: no staging round.
            let outcome = self.peer(*dest).and_then(|peer| {
                txn.instantiate(&peer, req.vecs, req.handles, req.descriptors, false)?;
                txn.commit_unicast()
            });
            report.destinations.push((*dest, outcome));
        } else {
            let mut slots: Vec<(PeerId, Option<Result<()>>)> = Vec::new();
            for dest in req.destinations {
                let staged = self.peer(*dest).and_then(|peer| {
                    txn.instantiate(&peer, req.vecs, req.handles, req.descriptors, true)
                });
                slots.push((*dest, staged.err().map(Err)));
            }
            let mut committed = txn.commit().into_iter();
            for (dest, slot) in slots {
                let outcome = match slot {
                    Some(err) => err,
                    None => {
                        let (peer, result) = committed
                            .next()
                            .ok_or(BusError::Internal("commit result missing"))?;
                        debug_assert_eq!(peer, dest);
                        result
                    }
                };
                report.destinations.push((dest, outcome));
            }
        }

        drop(sender_ref);
        Ok(report)
    }

    /// Receive the front message of `id`'s queue.
    pub fn recv(&self, id: PeerId, flags: u64) -> Result<RecvMsg> {
        let flags = RecvFlags::from_bits(flags)
            .map_err(|bad| BusError::InvalidFlags { flags: bad.flags })?;
        self.peer(id)?.recv(flags)
    }

    /// Block until `id`'s queue is readable or the timeout expires.
    pub fn wait_readable(&self, id: PeerId, timeout: Duration) -> Result<()> {
        self.peer(id)?.wait_readable(timeout)
    }

    /// Return a published slice to `id`'s pool.
    pub fn slice_release(&self, id: PeerId, offset: u64) -> Result<()> {
        self.peer(id)?.slice_release(offset)
    }

    /// Copy a published slice out of `id`'s pool.
    pub fn read_slice(&self, id: PeerId, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.peer(id)?.read_slice(offset, size)
    }

    /// Resolve one of `id`'s installed descriptor numbers.
    pub fn descriptor_value(&self, id: PeerId, number: u32) -> Result<Option<u32>> {
        self.peer(id)?.descriptor_value(number)
    }

    /// Disconnect a peer. Idempotent; blocks until teardown is complete.
    pub fn disconnect(&self, id: PeerId) -> Result<()> {
        self.peer(id)?.disconnect()
    }

    /// Remove a peer from the bus, disconnecting it first.
    pub fn remove_peer(&self, id: PeerId) -> Result<()> {
        let peer = self
            .peers
            .write()
            .remove(&id.get())
            .ok_or(BusError::InvalidArgument {
                detail: "unknown peer id",
            })?;
        match peer.disconnect() {
            Ok(()) | Err(BusError::Shutdown) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Number of peers currently registered.
    #[must_use]
    pub fn n_peers(&self) -> usize {
        self.peers.read().len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("peers", &self.n_peers())
            .finish_non_exhaustive()
    }
}
