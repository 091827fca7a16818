//! Chain-aware frame walking shared by the log engine's read path and the
//! repair engine's backward scan.
//!
//! Both need the same thing: walk frames tail-to-head, verifying each
//! frame's stored CRC against the chain and checking index contiguity.
//! `BackwardFrames` is the single place that logic lives, so the read path
//! and the repair path can't silently drift apart.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{GianError, Result};
use crate::frame::{self, FRAME_OVERHEAD};
use crate::reverse_reader::ReverseReader;

/// One fully-verified frame, yielded oldest-field-order even though frames
/// are discovered newest-first.
#[derive(Debug, Clone)]
pub struct BackwardFrame {
    pub index: u64,
    pub payload: Vec<u8>,
    pub stored_crc: u32,
    /// On-disk bytes of this frame, forward order (for splicing during repair).
    pub raw: Vec<u8>,
}

/// Walks a file's frames from tail to head, verifying the CRC chain and
/// index contiguity as it goes. A frame's CRC can only be verified once its
/// predecessor's stored CRC (further back in the file) has been read, so
/// the walker carries that one 4-byte value forward between calls rather
/// than the predecessor's whole frame — the predecessor's body may sit in a
/// damaged region that never needs to be parsed.
pub struct BackwardFrames<'a> {
    rr: ReverseReader<'a>,
    pending_crc: Option<u32>,
    last_yielded_index: Option<u64>,
}

impl<'a> BackwardFrames<'a> {
    pub fn new(rr: ReverseReader<'a>) -> Self {
        BackwardFrames {
            rr,
            pending_crc: None,
            last_yielded_index: None,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.rr.remaining()
    }

    /// Returns the next frame walking backward, `Ok(None)` at a clean
    /// boundary (frame 1 fully consumed, or an empty file), or `Err` on any
    /// chain invariant violation.
    pub fn next_frame(&mut self) -> Result<Option<BackwardFrame>> {
        let stored_crc = match self.pending_crc.take() {
            Some(crc) => crc,
            None => {
                let mut crc_buf = [0u8; 4];
                let n = self.rr.read(&mut crc_buf)?;
                if n == 0 {
                    return Ok(None);
                }
                if n != 4 {
                    return Err(GianError::Truncated);
                }
                u32::from_be_bytes(crc_buf)
            }
        };

        let current = read_frame_body(&mut self.rr, stored_crc)?;

        if let Some(last) = self.last_yielded_index {
            if current.index + 1 != last {
                return Err(GianError::IndexMismatch);
            }
        }

        if current.index == 1 {
            if self.rr.remaining() != 0 {
                return Err(GianError::IndexMismatch);
            }
            let expected = frame::compute_crc(0, 1, current.payload.len() as u32, &current.payload);
            if expected != current.stored_crc {
                return Err(GianError::ChecksumMismatch);
            }
            self.last_yielded_index = Some(1);
            return Ok(Some(current));
        }

        let mut prev_crc_buf = [0u8; 4];
        if self.rr.read(&mut prev_crc_buf)? != 4 {
            return Err(GianError::Truncated);
        }
        let prev_crc = u32::from_be_bytes(prev_crc_buf);

        let expected = frame::compute_crc(
            prev_crc,
            current.index,
            current.payload.len() as u32,
            &current.payload,
        );
        if expected != current.stored_crc {
            return Err(GianError::ChecksumMismatch);
        }

        self.last_yielded_index = Some(current.index);
        self.pending_crc = Some(prev_crc);
        Ok(Some(current))
    }
}

/// Reads the rest of a frame walking backward, given its CRC slot (already
/// consumed by the caller): trailing len(4), payload(len), leading len(4),
/// index(8).
fn read_frame_body(rr: &mut ReverseReader<'_>, stored_crc: u32) -> Result<BackwardFrame> {
    let mut len_trailing_buf = [0u8; 4];
    if rr.read(&mut len_trailing_buf)? != 4 {
        return Err(GianError::Truncated);
    }
    let len_trailing = u32::from_be_bytes(len_trailing_buf);
    if !frame::validate_len(len_trailing) {
        return Err(GianError::InvalidLength);
    }

    let mut payload = vec![0u8; len_trailing as usize];
    if rr.read(&mut payload)? != payload.len() {
        return Err(GianError::Truncated);
    }

    let mut len_leading_buf = [0u8; 4];
    if rr.read(&mut len_leading_buf)? != 4 {
        return Err(GianError::Truncated);
    }
    if len_leading_buf != len_trailing_buf {
        return Err(GianError::LengthMismatch);
    }

    let mut index_buf = [0u8; 8];
    if rr.read(&mut index_buf)? != 8 {
        return Err(GianError::Truncated);
    }
    let index = u64::from_be_bytes(index_buf);

    let mut raw = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    raw.extend_from_slice(&index_buf);
    raw.extend_from_slice(&len_leading_buf);
    raw.extend_from_slice(&payload);
    raw.extend_from_slice(&len_trailing_buf);
    raw.extend_from_slice(&stored_crc.to_be_bytes());

    Ok(BackwardFrame {
        index,
        payload,
        stored_crc,
        raw,
    })
}

/// Forward-skips from the start of `file` until the frame with `index ==
/// to_index` has been fully consumed, returning the file offset right
/// after it. Used to resume a reverse read after a mid-stream repair: the
/// file has already been validated, so this walk trusts the structure and
/// only extracts offsets, matching the log engine's own simplification.
pub fn seek_to_after_index(file: &mut File, to_index: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut pos = 0u64;
    loop {
        let mut index_buf = [0u8; 8];
        if let Err(e) = file.read_exact(&mut index_buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(GianError::IndexMismatch);
            }
            return Err(e.into());
        }
        let index = u64::from_be_bytes(index_buf);

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);

        let frame_len = FRAME_OVERHEAD as u64 + len as u64;
        file.seek(SeekFrom::Current(frame_len as i64 - 12))?;
        pos += frame_len;

        if index == to_index {
            return Ok(pos);
        }
    }
}
