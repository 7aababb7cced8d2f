//! Low-level byte helpers shared by the protocol and flash layers.
//!
//! The reader functions read exactly the bytes they promise or return an
//! error - there is no partial-read ambiguity.

use std::io::Read;

use crate::{Error, Result};

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Decode a 4-byte little-endian response buffer (chip IDs, status words).
#[inline]
pub(crate) fn resp_u32(b: [u8; 4]) -> u32 {
    u32::from_le_bytes(b)
}

/// Round `x` up to a multiple of `size`, which must be a power of two.
///
/// Returns [`Error::InvalidRange`] on overflow.
#[inline]
pub(crate) fn page_round_up(x: u32, size: u32) -> Result<u32> {
    debug_assert!(size.is_power_of_two());
    x.checked_add(size - 1)
        .map(|v| v & !(size - 1))
        .ok_or(Error::InvalidRange)
}

/// Convert a buffer length to the 32-bit address space used by flash.
#[inline]
pub(crate) fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidRange)
}

/// Decode a run of little-endian words into `out`.
///
/// `bytes` must hold exactly `out.len() * 4` bytes.
pub(crate) fn le_words(bytes: &[u8], out: &mut [u32]) -> Result<()> {
    if bytes.len() != out.len() * 4 {
        return Err(Error::InvalidRange);
    }
    for (w, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}
