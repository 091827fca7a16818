//! A reader that walks a file backward from end-of-file toward offset 0.
//!
//! `read(dst)` fills `dst` such that the last byte of `dst` is the byte at
//! the highest file offset touched by that call, and each subsequent call
//! yields ever-earlier bytes. This lets the log engine parse frames in
//! reverse without re-reading the whole file on every step.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::frame::CHUNK_SIZE;

/// Backward-reading wrapper around a seekable file.
///
/// Mirrors `std::io::BufReader`'s "sticky error" behavior: once a read
/// fails, every subsequent `read` call returns the same error rather than
/// retrying the file.
pub struct ReverseReader<'a> {
    file: &'a mut File,
    buf: Vec<u8>,
    /// Readable region of `buf` is `buf[..r]`; new data is always the
    /// earliest file bytes still buffered, so reads drain from the end.
    r: usize,
    /// Current logical cursor: file offset below which nothing has been
    /// handed to the caller yet.
    file_cur: u64,
    err: Option<io::ErrorKind>,
}

impl<'a> ReverseReader<'a> {
    pub fn new(file: &'a mut File) -> io::Result<Self> {
        Self::with_capacity(file, CHUNK_SIZE)
    }

    pub fn with_capacity(file: &'a mut File, capacity: usize) -> io::Result<Self> {
        let capacity = if capacity == 0 { CHUNK_SIZE } else { capacity };
        let end = file.seek(SeekFrom::End(0))?;
        Ok(ReverseReader {
            file,
            buf: Vec::with_capacity(capacity),
            r: 0,
            file_cur: end,
            err: None,
        })
    }

    /// Start the backward walk from `bound` instead of the real end of the
    /// file. Used to resume a reverse read partway through the file (e.g.
    /// after `read_to_index` has forward-skipped to a known-good offset)
    /// without re-reading everything above it.
    pub fn with_capacity_from(file: &'a mut File, capacity: usize, bound: u64) -> Self {
        let capacity = if capacity == 0 { CHUNK_SIZE } else { capacity };
        ReverseReader {
            file,
            buf: Vec::with_capacity(capacity),
            r: 0,
            file_cur: bound,
            err: None,
        }
    }

    /// Number of bytes not yet handed to a caller.
    pub fn remaining(&self) -> u64 {
        self.file_cur + self.r as u64
    }

    /// Fill `dst` with the next (earlier-in-file) bytes. Returns the number
    /// of bytes written, which may be less than `dst.len()` only once the
    /// logical cursor nears offset 0. Returns `Ok(0)` at true EOF.
    ///
    /// On a short read the valid bytes are written to the *tail* of `dst`
    /// (`dst[dst.len() - n..]`); the leading `dst.len() - n` bytes are left
    /// untouched, consistent with "the last byte of `dst` is always the
    /// highest file offset touched by this call".
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if let Some(kind) = self.err {
            return Err(io::Error::from(kind));
        }

        match self.read_inner(dst) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.err = Some(e.kind());
                Err(e)
            }
        }
    }

    fn read_inner(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        // Fast path: the whole request is already buffered.
        if dst.len() <= self.r {
            let start = self.r - dst.len();
            dst.copy_from_slice(&self.buf[start..self.r]);
            self.r = start;
            return Ok(dst.len());
        }

        let dst_len = dst.len();
        let mut produced = 0usize;
        // Drain whatever is left in the buffer first; it belongs at the
        // tail end of `dst` since it is earlier-than-what-we-already-gave
        // but later-than-what-the-file-still-holds.
        if self.r > 0 {
            dst[dst_len - self.r..].copy_from_slice(&self.buf[..self.r]);
            produced = self.r;
            self.r = 0;
        }

        if self.file_cur == 0 {
            return Ok(produced);
        }

        let needed = dst_len - produced;

        if needed > self.buf.capacity() {
            // Bypass the internal buffer for oversized requests: read
            // straight into the still-unfilled prefix of `dst`, tail-aligned.
            let read_from = self.file_cur.saturating_sub(needed as u64);
            let to_read = (self.file_cur - read_from) as usize;
            self.file.seek(SeekFrom::Start(read_from))?;
            self.file
                .read_exact(&mut dst[dst_len - produced - to_read..dst_len - produced])?;
            self.file_cur = read_from;
            return Ok(produced + to_read);
        }

        let read_from = self.file_cur.saturating_sub(self.buf.capacity() as u64);
        let chunk_len = (self.file_cur - read_from) as usize;
        self.file.seek(SeekFrom::Start(read_from))?;
        self.buf.resize(chunk_len, 0);
        self.file.read_exact(&mut self.buf)?;
        self.file_cur = read_from;

        let take = needed.min(chunk_len);
        dst[dst_len - produced - take..dst_len - produced]
            .copy_from_slice(&self.buf[chunk_len - take..]);
        self.r = chunk_len - take;
        produced += take;

        Ok(produced)
    }
}
