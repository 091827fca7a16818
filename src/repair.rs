//! Reconciles a primary log file against its `.bak` mirror after corruption.
//!
//! Corruption is expected to be local: a single bad byte run in one file,
//! while the other copy of the same stretch stayed intact. `fix` takes the
//! longest validated prefix from either file and the longest validated
//! suffix from either file and splices them back together.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{GianError, Result};
use crate::frame_chain::BackwardFrames;
use crate::reverse_reader::ReverseReader;

/// Result of walking a file forward from offset 0 verifying the CRC chain.
pub struct ForwardValidation {
    /// Index of the last frame fully validated, or 0 if the file is empty
    /// or its very first frame is already broken.
    pub last_valid_index: u64,
    /// True when the walk reached the exact end of the file with no
    /// leftover bytes, i.e. the whole file is one clean frame sequence.
    pub clean: bool,
    /// Raw bytes of the validated prefix, present only when `capture` was
    /// requested.
    pub data: Option<Vec<u8>>,
}

/// Walk `path` forward from offset 0, verifying the CRC chain and index
/// contiguity. Domain-level corruption is reported via `last_valid_index`
/// stopping short of the file's length, not as an `Err`; only a genuine
/// I/O failure is `Err`.
pub fn forward_validate(path: &Path, capture: bool) -> std::io::Result<ForwardValidation> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };

    let mut offset = 0usize;
    let mut prev_crc = 0u32;
    let mut last_valid_index = 0u64;
    let mut expected_index = 1u64;

    while offset < bytes.len() {
        let frame_start = offset;
        if bytes.len() - offset < 16 {
            break;
        }
        let index = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let len_leading = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;

        if !crate::frame::validate_len(len_leading) {
            break;
        }
        let len = len_leading as usize;
        if bytes.len() - offset < len + 8 {
            break;
        }
        let payload = &bytes[offset..offset + len];
        offset += len;
        let len_trailing = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;
        if len_trailing != len_leading {
            break;
        }
        let crc = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;

        if index != expected_index {
            offset = frame_start;
            break;
        }
        let expected_crc = crate::frame::compute_crc(prev_crc, index, len_leading, payload);
        if expected_crc != crc {
            offset = frame_start;
            break;
        }

        prev_crc = crc;
        last_valid_index = index;
        expected_index += 1;
    }

    let data = if capture {
        Some(bytes[..offset].to_vec())
    } else {
        None
    };

    Ok(ForwardValidation {
        last_valid_index,
        clean: offset == bytes.len(),
        data,
    })
}

/// Walk `path` backward, collecting frames down to (but not including)
/// `head_index`. Returns `Ok(Some(bytes))` with the frames `(head_index,
/// last]` concatenated in forward order on a clean join, `Ok(None)` if the
/// chain breaks before reaching `head_index`.
pub fn backward_load_to(path: &Path, head_index: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let rr = ReverseReader::new(&mut file)?;
    let mut walker = BackwardFrames::new(rr);

    // The tail frame's own index tells us whether there's anything above
    // `head_index` at all: if the file's newest frame is already at or
    // below `head_index`, the head prefix already covers everything and
    // no splice is needed.
    let tail = match walker.next_frame() {
        Ok(Some(f)) => f,
        Ok(None) => return Ok(Some(Vec::new())),
        Err(_) => return Ok(None),
    };
    if tail.index <= head_index {
        return Ok(Some(Vec::new()));
    }

    // Collect frames down through `head_index + 1` and stop there: the
    // chain-verification of that frame already consumed (but does not
    // itself re-validate) frame `head_index`'s stored CRC, which is all
    // the join needs. The rest of `head_index`'s own history is covered
    // by whichever source produced the validated head prefix.
    let mut frames = vec![tail];
    loop {
        if frames.last().unwrap().index == head_index + 1 {
            break;
        }
        match walker.next_frame() {
            Ok(Some(f)) => frames.push(f),
            Ok(None) => break,
            Err(_) => return Ok(None),
        }
    }

    if frames.last().map(|f| f.index) != Some(head_index + 1) {
        return Ok(None);
    }

    frames.reverse();
    let mut out = Vec::new();
    for f in &frames {
        out.extend_from_slice(&f.raw);
    }
    Ok(Some(out))
}

/// Copy `src` over `dst`, durably: write through a temp file in `dst`'s
/// directory, `sync_all`, then atomically rename over the target.
pub fn copy_file(dst: &Path, src: &Path) -> std::io::Result<()> {
    let bytes = std::fs::read(src)?;
    let dir = dst.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

fn backup_path(primary: &Path) -> PathBuf {
    let mut s = primary.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

/// Fast-path check used before the first commit: both files forward-validate
/// and agree on their last valid index (an absent file counts as index 0).
pub fn must_in_sync(primary: &Path, backup: &Path) -> std::io::Result<bool> {
    let p = forward_validate(primary, false)?;
    let b = forward_validate(backup, false)?;
    Ok(p.last_valid_index == b.last_valid_index)
}

/// Reconcile `primary` and its `.bak` mirror, rewriting both in place so
/// they hold the same, maximal, chain-valid frame sequence.
pub fn fix(primary: &Path) -> Result<()> {
    let backup = backup_path(primary);

    let p = forward_validate(primary, false)?;
    let b = forward_validate(&backup, false)?;

    if p.clean && b.clean && p.last_valid_index == b.last_valid_index {
        return Ok(());
    }

    if p.clean && b.clean {
        // Both are internally consistent but disagree on frame count: the
        // longer history wins outright.
        if p.last_valid_index > b.last_valid_index {
            copy_file(&backup, primary)?;
        } else {
            copy_file(primary, &backup)?;
        }
        return Ok(());
    }

    let p_cap = forward_validate(primary, true)?;
    let b_cap = forward_validate(&backup, true)?;

    let (head_index, head_data) = if p_cap.last_valid_index >= b_cap.last_valid_index {
        (p_cap.last_valid_index, p_cap.data.unwrap_or_default())
    } else {
        (b_cap.last_valid_index, b_cap.data.unwrap_or_default())
    };

    let tail_data = match backward_load_to(primary, head_index)? {
        Some(t) => Some(t),
        None => backward_load_to(&backup, head_index)?,
    };

    let tail_data = match tail_data {
        Some(t) => t,
        None => return Err(GianError::Unrecoverable(primary.to_path_buf())),
    };

    let mut fixed = head_data;
    fixed.extend_from_slice(&tail_data);

    write_durably(primary, &fixed)?;
    write_durably(&backup, &fixed)?;

    let p2 = forward_validate(primary, false)?;
    let b2 = forward_validate(&backup, false)?;
    if p2.last_valid_index != b2.last_valid_index {
        if p2.last_valid_index > b2.last_valid_index {
            copy_file(&backup, primary)?;
        } else {
            copy_file(primary, &backup)?;
        }
    }

    Ok(())
}

fn write_durably(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
