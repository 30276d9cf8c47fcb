//! Append-only segment files backing a handoff queue.
//!
//! A segment is a single file: an 8-byte big-endian read-offset header
//! followed by a data region of length-prefixed records. The read offset is
//! relative to the data region and points at the next block to be consumed.

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// Bytes reserved at the front of the file for the read-offset header.
pub(crate) const SEGMENT_HEADER_LEN: u64 = 8;
/// Bytes of length prefix per record.
pub(crate) const RECORD_HEADER_LEN: u64 = 8;

const SEGMENT_ID_WIDTH: usize = 8;

/// Zero-padded decimal name, so a lexicographic directory listing yields
/// queue order.
pub(crate) fn segment_file_name(id: u64) -> String {
    format!("{id:0width$}", width = SEGMENT_ID_WIDTH)
}

pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

/// One segment of a handoff queue. Owns the file handle.
#[derive(Debug)]
pub(crate) struct Segment {
    id: u64,
    path: PathBuf,
    file: File,
    /// Offset of the next unread block, relative to the data region.
    read_off: u64,
    /// Length of the data region.
    data_len: u64,
    max_size: u64,
    sync_interval: Duration,
    last_sync: Instant,
}

impl Segment {
    /// Create a fresh segment in `dir` with an empty data region.
    pub fn create(dir: &Path, id: u64, max_size: u64, sync_interval: Duration) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_data()?;
        Ok(Self {
            id,
            path,
            file,
            read_off: 0,
            data_len: 0,
            max_size,
            sync_interval,
            last_sync: Instant::now(),
        })
    }

    /// Open an existing segment, repairing any partial trailing record left
    /// by a crash mid-append. A write that crashed mid-record is therefore
    /// never observed by consumers.
    pub fn open(path: PathBuf, max_size: u64, sync_interval: Duration) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let id =
            parse_segment_id(&name).ok_or_else(|| Error::InvalidSegment(name.clone()))?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len < SEGMENT_HEADER_LEN {
            // Torn creation: nothing usable, rewrite an empty header.
            warn!(segment = %path.display(), "segment shorter than header, resetting");
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&0u64.to_be_bytes())?;
            file.sync_data()?;
            return Ok(Self {
                id,
                path,
                file,
                read_off: 0,
                data_len: 0,
                max_size,
                sync_interval,
                last_sync: Instant::now(),
            });
        }

        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let mut read_off = u64::from_be_bytes(header);

        // Walk the records; anything past the last complete one is a torn
        // write and gets truncated away.
        let mut data_len = file_len - SEGMENT_HEADER_LEN;
        let mut off = 0u64;
        while off + RECORD_HEADER_LEN <= data_len {
            file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN + off))?;
            let mut len_buf = [0u8; RECORD_HEADER_LEN as usize];
            file.read_exact(&mut len_buf)?;
            let len = u64::from_be_bytes(len_buf);
            let end = match off
                .checked_add(RECORD_HEADER_LEN)
                .and_then(|v| v.checked_add(len))
            {
                Some(end) if end <= data_len => end,
                _ => break,
            };
            off = end;
        }
        if off < data_len {
            warn!(
                segment = %path.display(),
                kept = off,
                dropped = data_len - off,
                "truncating partial trailing record"
            );
            file.set_len(SEGMENT_HEADER_LEN + off)?;
            file.sync_data()?;
            data_len = off;
        }

        if read_off > data_len {
            warn!(
                segment = %path.display(),
                read_off,
                data_len,
                "read offset past end of data, clamping"
            );
            read_off = data_len;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&read_off.to_be_bytes())?;
            file.sync_data()?;
        }

        Ok(Self {
            id,
            path,
            file,
            read_off,
            data_len,
            max_size,
            sync_interval,
            last_sync: Instant::now(),
        })
    }

    /// Append one length-prefixed block. Data reaches the OS before this
    /// returns; fsync is batched per `sync_interval`.
    ///
    /// A non-empty segment rejects an append that would push the file past
    /// its maximum size; the caller seals it and rolls over. An empty
    /// segment accepts a single oversized block so that blocks between the
    /// segment and queue limits remain storable.
    pub fn append(&mut self, block: &[u8]) -> Result<()> {
        let framed = RECORD_HEADER_LEN + block.len() as u64;
        if self.data_len > 0 && SEGMENT_HEADER_LEN + self.data_len + framed > self.max_size {
            return Err(Error::SegmentFull);
        }
        self.file
            .seek(SeekFrom::Start(SEGMENT_HEADER_LEN + self.data_len))?;
        self.file.write_all(&(block.len() as u64).to_be_bytes())?;
        self.file.write_all(block)?;
        self.data_len += framed;
        self.maybe_sync()?;
        Ok(())
    }

    /// Read the block at the read offset without advancing.
    pub fn current(&mut self) -> Result<Vec<u8>> {
        let (len, start) = self.record_at(self.read_off)?;
        let mut block = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    /// Move the read offset past the current block and persist it into the
    /// header.
    pub fn advance(&mut self) -> Result<()> {
        let (len, _) = self.record_at(self.read_off)?;
        self.read_off += RECORD_HEADER_LEN + len;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.read_off.to_be_bytes())?;
        self.maybe_sync()?;
        Ok(())
    }

    /// Length and payload start of the record at `off`, or `Eof` at the
    /// data end.
    fn record_at(&mut self, off: u64) -> Result<(u64, u64)> {
        if off >= self.data_len {
            return Err(Error::Eof);
        }
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN + off))?;
        let mut len_buf = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);
        if off + RECORD_HEADER_LEN + len > self.data_len {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "record at offset {off} overruns segment {}",
                    self.path.display()
                ),
            )));
        }
        Ok((len, SEGMENT_HEADER_LEN + off + RECORD_HEADER_LEN))
    }

    fn maybe_sync(&mut self) -> Result<()> {
        if self.sync_interval.is_zero() || self.last_sync.elapsed() >= self.sync_interval {
            self.file.sync_data()?;
            self.last_sync = Instant::now();
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes remaining to be consumed.
    pub fn size(&self) -> u64 {
        self.data_len - self.read_off
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn read_off(&self) -> u64 {
        self.read_off
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn last_modified(&self) -> Result<SystemTime> {
        Ok(self.file.metadata()?.modified()?)
    }

    /// Delete the file. Consumes the segment; the handle closes with it.
    pub fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
