//! Record framing and the CRC chain linking each frame to its predecessor.
//!
//! On-disk layout of one frame, big-endian throughout:
//!
//!   [index: u64] [len: u32] [payload: len bytes] [len: u32] [crc32: u32]
//!
//! `len` is duplicated as a trailing sentinel so a reverse reader can find
//! the start of a frame without having scanned forward first. `crc32` is
//! the IEEE CRC32 of `prev_crc ‖ index ‖ len ‖ payload ‖ len`. The trailing
//! `len` is hashed a second time on purpose, to keep the checksum sensitive
//! to corruption of the sentinel itself.

use crate::error::{GianError, Result};

/// Write-buffer size and default reverse-read buffer size.
pub const CHUNK_SIZE: usize = 4096;

/// Hard cap on a single frame's payload length.
pub const ONE_GB: u32 = 1 << 30;

/// Bytes of fixed overhead around a frame's payload:
/// index(8) + len(4) + len(4) + crc32(4).
pub const FRAME_OVERHEAD: usize = 8 + 4 + 4 + 4;

pub fn validate_len(len: u32) -> bool {
    len > 0 && len <= ONE_GB
}

/// IEEE CRC32 of `prev_crc ‖ index ‖ len ‖ payload ‖ len`.
pub fn compute_crc(prev_crc: u32, index: u64, len: u32, payload: &[u8]) -> u32 {
    let len_bytes = len.to_be_bytes();
    let mut crc = Crc32::new();
    crc.update(&prev_crc.to_be_bytes());
    crc.update(&index.to_be_bytes());
    crc.update(&len_bytes);
    crc.update(payload);
    crc.update(&len_bytes);
    crc.finish()
}

/// Encode a single frame. Returns the frame bytes and the CRC that should
/// become `prev_crc` for the next frame in the chain.
pub fn encode(prev_crc: u32, index: u64, payload: &[u8]) -> Result<(Vec<u8>, u32)> {
    let len = u32::try_from(payload.len()).map_err(|_| GianError::InvalidLength)?;
    if !validate_len(len) {
        return Err(GianError::InvalidLength);
    }
    let crc = compute_crc(prev_crc, index, len, payload);

    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
    Ok((buf, crc))
}

/// Hand-rolled IEEE CRC32 (same polynomial/reflection as `crc32fast`/zlib),
/// kept dependency-free since the chain is hashed byte-by-byte in small
/// pieces rather than over one contiguous buffer.
struct Crc32 {
    state: u32,
}

impl Crc32 {
    fn new() -> Self {
        Crc32 { state: 0xFFFF_FFFF }
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= byte as u32;
            for _ in 0..8 {
                let mask = (self.state & 1).wrapping_neg();
                self.state = (self.state >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
    }

    fn finish(&self) -> u32 {
        !self.state
    }
}
