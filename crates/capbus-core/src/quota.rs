//! Per-peer resource quota.
//!
//! Senders charge the destination's quota when a message is instantiated
//! and the charge is dropped when the message is deallocated. All
//! accounting happens under the peer resource lock, so plain integers
//! suffice.

use capbus_error::{BusError, Result};

use crate::message::MessageCharge;

/// Quota ceilings for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuotaLimits {
    pub max_bytes: u64,
    pub max_slices: u32,
    pub max_handles: u32,
    pub max_descriptors: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_bytes: 16 << 20,
            max_slices: 1024,
            max_handles: 4096,
            max_descriptors: 1024,
        }
    }
}

/// Live quota accounting for one peer.
#[derive(Debug)]
pub struct Quota {
    limits: QuotaLimits,
    bytes: u64,
    slices: u32,
    handles: u32,
    descriptors: u32,
}

impl Quota {
    #[must_use]
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            bytes: 0,
            slices: 0,
            handles: 0,
            descriptors: 0,
        }
    }

    /// Charge `c` against the quota, or fail without charging anything.
    pub fn charge(&mut self, c: MessageCharge) -> Result<()> {
        if self.bytes.saturating_add(c.bytes) > self.limits.max_bytes {
            return Err(BusError::QuotaExceeded { what: "bytes" });
        }
        if self.slices.saturating_add(c.slices) > self.limits.max_slices {
            return Err(BusError::QuotaExceeded { what: "slices" });
        }
        if self.handles.saturating_add(c.handles) > self.limits.max_handles {
            return Err(BusError::QuotaExceeded { what: "handles" });
        }
        if self.descriptors.saturating_add(c.descriptors) > self.limits.max_descriptors {
            return Err(BusError::QuotaExceeded { what: "descriptors" });
        }
        self.bytes += c.bytes;
        self.slices += c.slices;
        self.handles += c.handles;
        self.descriptors += c.descriptors;
        Ok(())
    }

    /// Return a charge. Saturating: a reset may have zeroed the accounting
    /// while a straggling message was still in flight.
    pub fn discharge(&mut self, c: MessageCharge) {
        self.bytes = self.bytes.saturating_sub(c.bytes);
        self.slices = self.slices.saturating_sub(c.slices);
        self.handles = self.handles.saturating_sub(c.handles);
        self.descriptors = self.descriptors.saturating_sub(c.descriptors);
    }

    /// Zero the accounting (peer reset).
    pub fn reset(&mut self) {
        self.bytes = 0;
        self.slices = 0;
        self.handles = 0;
        self.descriptors = 0;
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn used_slices(&self) -> u32 {
        self.slices
    }
}
