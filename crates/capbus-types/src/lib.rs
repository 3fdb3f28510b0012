//! Foundation types for the capbus IPC bus.
//!
//! This crate defines the cross-cutting value types referenced throughout the
//! workspace: peer and handle identifiers, the packed queue stamp word, the
//! caller-facing flag words with their checked decoders, and the wire limits.
//! Runtime machinery (queues, pools, peers) lives in `capbus-core`.

pub mod encoding;

use std::fmt;
use std::num::NonZeroU64;

// ---------------------------------------------------------------------------
// Wire limits
// ---------------------------------------------------------------------------

/// Required alignment (and minimum granule) of a receive pool, in bytes.
pub const POOL_ALIGN: u64 = 4096;

/// Maximum number of payload vectors accepted by a single send.
pub const VEC_MAX: usize = 512;

/// Maximum number of descriptors accepted by a single send.
pub const FD_MAX: usize = 256;

/// Sentinel pool offset meaning "no slice".
pub const OFFSET_INVALID: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Opaque identifier of a peer on the bus.
///
/// Allocated by the bus at peer creation and never reused. Besides addressing,
/// the raw value is used as the sender tie-break in queue ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PeerId(NonZeroU64);

impl PeerId {
    /// Construct a `PeerId` from a nonzero raw value.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.get())
    }
}

impl TryFrom<u64> for PeerId {
    type Error = InvalidPeerId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidPeerId { raw: value })
    }
}

/// Error returned when attempting to construct a zero `PeerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid PeerId {raw} (must be nonzero)")]
pub struct InvalidPeerId {
    raw: u64,
}

// ---------------------------------------------------------------------------
// HandleId
// ---------------------------------------------------------------------------

/// Receiver-local capability handle identifier.
///
/// Handle ids are allocated per peer by its handle table; the value 0 is
/// reserved as "no handle".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct HandleId(u64);

impl HandleId {
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// Timestamp / StampWord
// ---------------------------------------------------------------------------

/// Logical queue timestamp.
///
/// 63-bit counter whose least-significant bit is the stage flag: even values
/// are committed, odd values are staging. The value 0 means "unstamped".
/// Timestamps are produced only by the owning queue's clock, which advances
/// by 2 per tick so committed values are always even.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The unstamped sentinel.
    pub const ZERO: Self = Self(0);

    /// Largest representable timestamp (63 bits).
    pub const MAX_RAW: u64 = (1_u64 << 63) - 1;

    /// Construct a timestamp if `raw` fits in 63 bits.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        Some(Self(raw))
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the unstamped sentinel.
    #[inline]
    pub const fn is_unstamped(self) -> bool {
        self.0 == 0
    }

    /// Whether the stage flag is set.
    #[inline]
    pub const fn is_staging(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether this is a final, committed timestamp.
    #[inline]
    pub const fn is_committed(self) -> bool {
        self.0 != 0 && self.0 & 1 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts#{}", self.get())
    }
}

/// Kind of a queue node, carried in the low bit of the stamp word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    /// A regular message carrying a pool slice.
    Message,
    /// A delivery-failure notice (no slice attached).
    Notice,
}

impl NodeKind {
    #[inline]
    const fn to_bit(self) -> u64 {
        match self {
            Self::Message => 0,
            Self::Notice => 1,
        }
    }

    #[inline]
    const fn from_bit(bit: u64) -> Self {
        if bit & 1 == 0 {
            Self::Message
        } else {
            Self::Notice
        }
    }
}

/// Packed queue node header word: `timestamp << 1 | kind`.
///
/// The timestamp occupies the upper 63 bits (its own LSB being the stage
/// flag); the node kind sits in the low bit. Packing keeps the whole header a
/// single atomically publishable u64, and a raw comparison of two words from
/// the same queue orders by timestamp first, which is exactly the sort the
/// queue wants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StampWord(u64);

impl StampWord {
    const KIND_BITS: u32 = 1;
    const KIND_MASK: u64 = (1 << Self::KIND_BITS) - 1;

    /// An unstamped word of the given kind.
    #[inline]
    pub const fn unstamped(kind: NodeKind) -> Self {
        Self(kind.to_bit())
    }

    /// Pack a timestamp and node kind.
    #[inline]
    pub const fn pack(ts: Timestamp, kind: NodeKind) -> Self {
        Self(ts.get() << Self::KIND_BITS | kind.to_bit())
    }

    /// Raw packed value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw packed value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The timestamp portion.
    #[inline]
    pub const fn timestamp(self) -> Timestamp {
        Timestamp(self.0 >> Self::KIND_BITS)
    }

    /// The node kind portion.
    #[inline]
    pub const fn kind(self) -> NodeKind {
        NodeKind::from_bit(self.0 & Self::KIND_MASK)
    }

    /// Replace the timestamp, keeping the kind.
    #[inline]
    #[must_use]
    pub const fn with_timestamp(self, ts: Timestamp) -> Self {
        Self(ts.get() << Self::KIND_BITS | (self.0 & Self::KIND_MASK))
    }
}

// ---------------------------------------------------------------------------
// Flag words
// ---------------------------------------------------------------------------

/// Error returned by the flag decoders for unknown or conflicting bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid flag combination {flags:#x}")]
pub struct BadFlags {
    pub flags: u64,
}

/// Connect flag bits.
pub const CONNECT_FLAG_CLIENT: u64 = 1 << 0;
pub const CONNECT_FLAG_RESET: u64 = 1 << 1;
pub const CONNECT_FLAG_QUERY: u64 = 1 << 2;

/// Decoded connect mode. Exactly one mode must be present in the flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectMode {
    /// Establish a fresh connection; `pool_size` must be nonzero and
    /// pool-aligned.
    Client,
    /// Drain queue and pool, keep identity; `pool_size` must be zero.
    Reset,
    /// Report the pool size; `pool_size` must be zero.
    Query,
}

impl ConnectMode {
    /// Decode a connect flag word, rejecting unknown bits and combinations.
    pub fn from_flags(flags: u64) -> Result<Self, BadFlags> {
        const KNOWN: u64 = CONNECT_FLAG_CLIENT | CONNECT_FLAG_RESET | CONNECT_FLAG_QUERY;
        if flags & !KNOWN != 0 {
            return Err(BadFlags { flags });
        }
        match flags {
            CONNECT_FLAG_CLIENT => Ok(Self::Client),
            CONNECT_FLAG_RESET => Ok(Self::Reset),
            CONNECT_FLAG_QUERY => Ok(Self::Query),
            _ => Err(BadFlags { flags }),
        }
    }
}

/// Send flag bits.
pub const SEND_FLAG_CONTINUE: u64 = 1 << 0;
pub const SEND_FLAG_SILENT: u64 = 1 << 1;
pub const SEND_FLAG_RELEASE: u64 = 1 << 2;

/// Decoded send flags.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct SendFlags {
    /// More parts of the same transaction follow.
    pub continuation: bool,
    /// No reply is expected; recorded in the delivered message header.
    pub silent: bool,
    /// Release the sender's handle references after a successful send.
    pub release_handles: bool,
}

impl SendFlags {
    pub fn from_bits(flags: u64) -> Result<Self, BadFlags> {
        const KNOWN: u64 = SEND_FLAG_CONTINUE | SEND_FLAG_SILENT | SEND_FLAG_RELEASE;
        if flags & !KNOWN != 0 {
            return Err(BadFlags { flags });
        }
        Ok(Self {
            continuation: flags & SEND_FLAG_CONTINUE != 0,
            silent: flags & SEND_FLAG_SILENT != 0,
            release_handles: flags & SEND_FLAG_RELEASE != 0,
        })
    }
}

/// Recv flag bits.
pub const RECV_FLAG_PEEK: u64 = 1 << 0;

/// Decoded recv flags.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct RecvFlags {
    /// Inspect the front message without dequeuing it.
    pub peek: bool,
}

impl RecvFlags {
    pub fn from_bits(flags: u64) -> Result<Self, BadFlags> {
        if flags & !RECV_FLAG_PEEK != 0 {
            return Err(BadFlags { flags });
        }
        Ok(Self {
            peek: flags & RECV_FLAG_PEEK != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
