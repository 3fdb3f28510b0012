//! Little-endian encoding helpers for slice payload layout.
//!
//! Messages land in a receiver's pool as `[payload][handles][descriptors]`;
//! the handle ids and descriptor values use fixed-width little-endian
//! encoding so receivers can index the tail without a framing pass.

/// Append a `u32` in little-endian order.
#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u64` in little-endian order.
#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Read a `u32` in little-endian order at `offset`, if in bounds.
#[inline]
#[must_use]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Read a `u64` in little-endian order at `offset`, if in bounds.
#[inline]
#[must_use]
pub fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}
