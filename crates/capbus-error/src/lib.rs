//! Error types for the capbus IPC bus.
//!
//! One variant per caller-visible error kind, plus a numeric [`ErrorCode`]
//! mirror for embedders that speak a C-ish status word.

use thiserror::Error;

/// Primary error type for bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    // === Flow control ===
    /// The queue holds nothing readable (empty, or blocked behind stagers).
    #[error("operation would block")]
    WouldBlock,

    // === Peer lifecycle ===
    /// The peer has never been connected.
    #[error("peer is not connected")]
    NotConnected,

    /// The peer has been deactivated; no further operations are accepted.
    #[error("peer is shut down")]
    Shutdown,

    /// A second client connect raced an existing connection.
    #[error("peer is already connected")]
    AlreadyConnected,

    // === Argument validation ===
    /// Bad flag combination.
    #[error("invalid flags {flags:#x}")]
    InvalidFlags { flags: u64 },

    /// Pool size is zero, not aligned, or nonzero where zero is required.
    #[error("invalid pool size {size}")]
    InvalidPoolSize { size: u64 },

    /// Too many payload vectors in one send.
    #[error("too many payload vectors: {count} (max {max})")]
    TooManyVectors { count: usize, max: usize },

    /// Too many descriptors in one send.
    #[error("too many descriptors: {count} (max {max})")]
    TooManyDescriptors { count: usize, max: usize },

    /// Generic invalid argument (unknown slice offset, zeroed-field
    /// violations, destination set empty).
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: &'static str },

    // === Resources ===
    /// Destination peer's quota would be exceeded.
    #[error("quota exceeded: {what}")]
    QuotaExceeded { what: &'static str },

    /// Allocation failed (pool space or descriptor reservation).
    #[error("out of memory")]
    OutOfMemory,

    /// A payload copy failed; partial state is preserved only when already
    /// committed.
    #[error("fault while copying payload")]
    Fault,

    // === Internal ===
    /// The queue clock cannot tick without colliding with the stage bit.
    #[error("logical clock exhausted")]
    ClockExhausted,

    /// A structural invariant was violated; the operation was aborted with
    /// the structure left consistent.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl BusError {
    /// Numeric code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::WouldBlock => ErrorCode::WouldBlock,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Shutdown => ErrorCode::Shutdown,
            Self::AlreadyConnected => ErrorCode::AlreadyConnected,
            Self::InvalidFlags { .. }
            | Self::InvalidPoolSize { .. }
            | Self::TooManyVectors { .. }
            | Self::TooManyDescriptors { .. }
            | Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::Fault => ErrorCode::Fault,
            Self::ClockExhausted | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the error indicates a transient empty-queue condition.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Numeric status codes for embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    WouldBlock = 1,
    NotConnected = 2,
    Shutdown = 3,
    AlreadyConnected = 4,
    InvalidArgument = 5,
    QuotaExceeded = 6,
    OutOfMemory = 7,
    Fault = 8,
    Internal = 9,
}

/// Convenience alias used across the workspace.
pub type Result<T, E = BusError> = std::result::Result<T, E>;
