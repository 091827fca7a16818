//! Public append-only log: buffered writes, reverse reads, and automatic
//! repair on corruption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use crate::error::{GianError, Result};
use crate::frame::{self, CHUNK_SIZE};
use crate::frame_chain;
use crate::repair;
use crate::reverse_reader::ReverseReader;

/// An append-only record log mirrored across a primary file and a `.bak`
/// backup, self-healing on read-time or write-time corruption.
///
/// Not `Sync`: callers must not invoke `write`, `read`, `force_commit`,
/// `fix`, or `close` concurrently on the same instance. A caller-driven
/// periodic flush (an OS timer, a `tokio::time::interval`, whatever fits
/// the embedding application) may call `force_commit()` on a cadence; once
/// `close()` has run, further calls return `Err(GianError::Dead)` rather
/// than panicking, so the collaborator can simply stop on its next tick.
pub struct Log {
    path: PathBuf,
    dead: bool,

    write: WriteState,
    read: Option<ReadState>,
}

struct WriteState {
    loaded: bool,
    last_checksum: u32,
    last_write_index: u64,
    uncommit_buffer: Vec<u8>,
}

struct ReadState {
    file: File,
    /// File offset below which nothing has been handed to the caller yet;
    /// the bound a fresh `ReverseReader` resumes from on the next frame.
    cursor: u64,
    last_read_checksum: u32,
    last_read_index: u64,
    exhausted: bool,
}

impl Log {
    /// Open (lazily: nothing touches disk yet) the log at `path`. The
    /// backup mirror lives at `path` with `.bak` appended.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Log {
            path: path.as_ref().to_path_buf(),
            dead: false,
            write: WriteState {
                loaded: false,
                last_checksum: 0,
                last_write_index: 0,
                uncommit_buffer: Vec::new(),
            },
            read: None,
        }
    }

    pub fn file_name(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(".bak");
        PathBuf::from(s)
    }

    /// Buffer `payload` for writing, flushing the current buffer first if
    /// appending would overflow `CHUNK_SIZE`, or committing directly when
    /// `payload` alone is larger than `CHUNK_SIZE`. A zero-length payload
    /// contributes nothing.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if self.dead {
            return Err(GianError::Dead);
        }
        if payload.is_empty() {
            return Ok(());
        }

        if payload.len() > CHUNK_SIZE {
            self.force_commit()?;
            return self.commit(payload);
        }

        if !self.write.uncommit_buffer.is_empty()
            && self.write.uncommit_buffer.len() + payload.len() > CHUNK_SIZE
        {
            self.force_commit()?;
        }
        self.write.uncommit_buffer.extend_from_slice(payload);
        Ok(())
    }

    /// Flush the buffered bytes, if any, as a single frame.
    pub fn force_commit(&mut self) -> Result<()> {
        if self.dead {
            return Err(GianError::Dead);
        }
        if self.write.uncommit_buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.write.uncommit_buffer);
        self.commit(&data)
    }

    fn commit(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if !self.write.loaded {
            self.lazy_init()?;
        }

        let new_index = self.write.last_write_index + 1;
        let (bytes, crc) = frame::encode(self.write.last_checksum, new_index, data)?;

        let backup = self.backup_path();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        append_frame(&self.path, &bytes)?;
        append_frame(&backup, &bytes)?;

        self.write.last_checksum = crc;
        self.write.last_write_index = new_index;
        Ok(())
    }

    fn lazy_init(&mut self) -> Result<()> {
        let backup = self.backup_path();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if !repair::must_in_sync(&self.path, &backup)? {
            repair::fix(&self.path)?;
        }

        let head = read_first_frame_crc(&self.path)?;
        if let Some((index, crc)) = head {
            self.write.last_write_index = index;
            self.write.last_checksum = crc;
        } else {
            self.write.last_write_index = 0;
            self.write.last_checksum = 0;
        }
        self.write.loaded = true;
        Ok(())
    }

    /// Return the next (progressively older) record, or `Ok(None)` at the
    /// start of the log.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.dead {
            return Err(GianError::Dead);
        }

        if self.read.is_none() {
            if !self.write.uncommit_buffer.is_empty() {
                let data = self.write.uncommit_buffer.clone();
                // The uncommitted buffer has no on-disk frame yet; surface
                // it once as the newest record, then fall through to disk
                // on the next call by opening the read state now.
                self.open_read_state()?;
                return Ok(Some(data));
            }
            self.open_read_state()?;
        }

        self.read_frame()
    }

    fn open_read_state(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        let cursor = file.metadata()?.len();
        self.read = Some(ReadState {
            file,
            cursor,
            last_read_checksum: 0,
            last_read_index: 0,
            exhausted: false,
        });
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.try_read_frame() {
                Ok(outcome) => return Ok(outcome),
                Err(GianError::InvalidLength)
                | Err(GianError::LengthMismatch)
                | Err(GianError::IndexMismatch)
                | Err(GianError::ChecksumMismatch)
                | Err(GianError::Truncated) => {
                    self.repair_then_retry()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let state = self.read.as_mut().expect("read state opened by caller");
        if state.exhausted {
            return Ok(None);
        }

        let at_start = state.last_read_index == 0;
        let mut rr = ReverseReader::with_capacity_from(&mut state.file, CHUNK_SIZE, state.cursor);

        if at_start {
            let mut tail_crc = [0u8; 4];
            let n = rr.read(&mut tail_crc)?;
            if n == 0 {
                state.cursor = rr.remaining();
                state.exhausted = true;
                return Ok(None);
            }
            if n != 4 {
                state.cursor = rr.remaining();
                return Err(GianError::Truncated);
            }
            state.last_read_checksum = u32::from_be_bytes(tail_crc);
        }

        let mut len_buf = [0u8; 4];
        if rr.read(&mut len_buf)? != 4 {
            state.cursor = rr.remaining();
            return Err(GianError::Truncated);
        }
        let len = u32::from_be_bytes(len_buf);
        if !frame::validate_len(len) {
            state.cursor = rr.remaining();
            return Err(GianError::InvalidLength);
        }

        let mut payload = vec![0u8; len as usize];
        if rr.read(&mut payload)? != payload.len() {
            state.cursor = rr.remaining();
            return Err(GianError::Truncated);
        }

        let mut len_leading_buf = [0u8; 4];
        if rr.read(&mut len_leading_buf)? != 4 {
            state.cursor = rr.remaining();
            return Err(GianError::Truncated);
        }
        if len_leading_buf != len_buf {
            state.cursor = rr.remaining();
            return Err(GianError::LengthMismatch);
        }

        let mut index_buf = [0u8; 8];
        if rr.read(&mut index_buf)? != 8 {
            state.cursor = rr.remaining();
            return Err(GianError::Truncated);
        }
        let index = u64::from_be_bytes(index_buf);

        if index == 1 {
            if rr.remaining() != 0 {
                state.cursor = rr.remaining();
                return Err(GianError::IndexMismatch);
            }
            let expected = frame::compute_crc(0, 1, len, &payload);
            if expected != state.last_read_checksum {
                state.cursor = 0;
                return Err(GianError::ChecksumMismatch);
            }
            state.cursor = 0;
            state.last_read_index = 1;
            state.exhausted = true;
            return Ok(Some(payload));
        }

        let mut prev_crc_buf = [0u8; 4];
        if rr.read(&mut prev_crc_buf)? != 4 {
            state.cursor = rr.remaining();
            return Err(GianError::Truncated);
        }
        let prev_crc = u32::from_be_bytes(prev_crc_buf);
        state.cursor = rr.remaining();

        let expected = frame::compute_crc(prev_crc, index, len, &payload);
        if expected != state.last_read_checksum {
            return Err(GianError::ChecksumMismatch);
        }
        if state.last_read_index != 0 && index + 1 != state.last_read_index {
            return Err(GianError::IndexMismatch);
        }

        state.last_read_checksum = prev_crc;
        state.last_read_index = index;
        Ok(Some(payload))
    }

    /// After `fix()` has reconciled the files, resume the read cursor just
    /// below the last frame this instance already returned, by forward-
    /// walking to that boundary on the now-repaired file (`read_to_index`
    /// in spec terms) rather than restarting the reverse scan from the
    /// tail.
    fn repair_then_retry(&mut self) -> Result<()> {
        let resume_index = self
            .read
            .as_ref()
            .map(|s| s.last_read_index)
            .unwrap_or(0);

        repair::fix(&self.path)?;
        self.read = None;

        if resume_index <= 1 {
            // Nothing (or only frame 1) has been fully consumed yet;
            // restarting from the tail is simplest and correct.
            self.open_read_state()?;
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        // `bound` is the start offset of frame `resume_index`, i.e. the end
        // offset of frame `resume_index - 1`: exactly where the reverse
        // walk was positioned right after this instance last returned
        // frame `resume_index`.
        let bound = frame_chain::seek_to_after_index(&mut file, resume_index - 1)?;

        let mut crc_buf = [0u8; 4];
        file.seek(SeekFrom::Start(bound - 4))?;
        file.read_exact(&mut crc_buf)?;
        let last_read_checksum = u32::from_be_bytes(crc_buf);

        self.read = Some(ReadState {
            file,
            cursor: bound,
            last_read_checksum,
            last_read_index: resume_index,
            exhausted: false,
        });
        Ok(())
    }

    /// Read every remaining record, concatenating payloads newest-first.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Drop the read cursor; the next `read()` restarts from the tail.
    pub fn reset(&mut self) -> Result<()> {
        if self.dead {
            return Err(GianError::Dead);
        }
        self.read = None;
        Ok(())
    }

    /// Flush, then rename both the primary and backup files. Refuses (with
    /// an error, rather than leaving a stale mirror) if the backup is
    /// missing while the primary exists.
    pub fn rename<P: AsRef<Path>>(&mut self, new_path: P) -> Result<()> {
        if self.dead {
            return Err(GianError::Dead);
        }
        self.force_commit()?;

        let new_path = new_path.as_ref().to_path_buf();
        let new_backup = {
            let mut s = new_path.as_os_str().to_owned();
            s.push(".bak");
            PathBuf::from(s)
        };
        let old_backup = self.backup_path();

        if self.path.exists() && !old_backup.exists() {
            return Err(GianError::MissingBackup(old_backup));
        }

        self.read = None;
        if self.path.exists() {
            std::fs::rename(&self.path, &new_path)?;
        }
        if old_backup.exists() {
            std::fs::rename(&old_backup, &new_backup)?;
        }
        self.path = new_path;
        Ok(())
    }

    /// Reconcile the primary and backup files immediately.
    pub fn fix(&mut self) -> Result<()> {
        if self.dead {
            return Err(GianError::Dead);
        }
        repair::fix(&self.path)
    }

    /// Final flush, then mark the instance dead. The flush error (if any)
    /// is still returned, but the handle is released and the instance is
    /// dead either way.
    pub fn close(&mut self) -> Result<()> {
        if self.dead {
            return Ok(());
        }
        let result = self.force_commit();
        self.read = None;
        self.dead = true;
        result
    }
}

fn append_frame(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

/// Read the first frame from the start of `path` and return `(index,
/// crc32)`, or `None` for an empty file.
fn read_first_frame_crc(path: &Path) -> std::io::Result<Option<(u64, u32)>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < 16 {
        return Ok(None);
    }
    let index = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let len = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let crc_start = 12 + len + 4;
    if bytes.len() < crc_start + 4 {
        return Ok(None);
    }
    let crc = u32::from_be_bytes(bytes[crc_start..crc_start + 4].try_into().unwrap());
    Ok(Some((index, crc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip_single_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);

        log.write(b"hello").unwrap();
        log.force_commit().unwrap();

        assert_eq!(log.read().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(log.read().unwrap(), None);
    }

    #[test]
    fn round_trip_many_records_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);

        for i in 0u32..1000 {
            log.write(&i.to_be_bytes()).unwrap();
            log.force_commit().unwrap();
        }

        for expected in (0u32..1000).rev() {
            let got = log.read().unwrap().expect("record expected");
            assert_eq!(u32::from_be_bytes(got.try_into().unwrap()), expected);
        }
        assert_eq!(log.read().unwrap(), None);
    }

    #[test]
    fn uncommitted_buffer_visible_before_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);

        log.write(b"alpha").unwrap();
        log.force_commit().unwrap();
        log.write(b"beta").unwrap();

        assert_eq!(log.read().unwrap(), Some(b"beta".to_vec()));
        assert_eq!(log.read().unwrap(), Some(b"alpha".to_vec()));
    }

    #[test]
    fn close_then_write_is_dead() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);
        log.write(b"x").unwrap();
        log.close().unwrap();
        assert!(matches!(log.write(b"y"), Err(GianError::Dead)));
    }

    #[test]
    fn rename_moves_both_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);
        log.write(b"x").unwrap();
        log.force_commit().unwrap();

        let new_path = dir.path().join("renamed");
        log.rename(&new_path).unwrap();

        assert!(new_path.exists());
        let mut backup = new_path.as_os_str().to_owned();
        backup.push(".bak");
        assert!(PathBuf::from(backup).exists());
        assert!(!path.exists());
    }

    #[test]
    fn mid_log_corruption_triggers_repair_on_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = Log::new(&path);
        for payload in [&b"a"[..], &b"bb"[..], &b"ccc"[..]] {
            log.write(payload).unwrap();
            log.force_commit().unwrap();
        }
        log.close().unwrap();

        let mut primary = std::fs::read(&path).unwrap();
        let last = primary.len() - 1;
        primary[last] ^= 0xFF;
        std::fs::write(&path, &primary).unwrap();

        let mut log2 = Log::new(&path);
        let all = log2.read_all().unwrap();
        assert_eq!(all, b"cccbba");
    }
}
