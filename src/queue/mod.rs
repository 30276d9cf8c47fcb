//! Durable multi-segment FIFO queue for hinted-handoff blocks.
//!
//! One queue per target node, one directory per queue. Producers append
//! length-prefixed blocks to the tail segment; the single consumer reads and
//! advances the head segment. The queue is bounded: when an append would push
//! the total past `max_size`, whole segments are dropped from the head until
//! the block fits.

mod segment;

use crate::telemetry;
use crate::{Error, Result};
use parking_lot::Mutex;
use segment::{parse_segment_id, Segment, RECORD_HEADER_LEN};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Sizing and durability options for one queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum bytes per queue before head eviction.
    pub max_size: u64,
    /// Maximum bytes per segment before rollover.
    pub max_segment_size: u64,
    /// fsync batching interval. Zero syncs on every write.
    pub sync_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: crate::config::DEFAULT_MAX_SIZE,
            max_segment_size: crate::config::DEFAULT_MAX_SEGMENT_SIZE,
            sync_interval: Duration::from_millis(100),
        }
    }
}

/// The consumption state of a queue: where the head cursor sits and where
/// the tail ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePosition {
    /// `<head segment path>:<read offset>`
    pub head: String,
    /// `<tail segment path>:<data length>`
    pub tail: String,
}

/// Ordered sequence of segments on disk under one directory.
///
/// Operations are serialized internally; producers and the single consumer
/// may call concurrently.
#[derive(Debug)]
pub struct Queue {
    dir: PathBuf,
    options: QueueOptions,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    opened: bool,
    /// Head first, tail last. Non-empty whenever the queue is open.
    segments: Vec<Segment>,
    dropped_segments: u64,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn total_bytes(&self) -> u64 {
        self.segments.iter().map(Segment::size).sum()
    }
}

impl Queue {
    /// Create a handle on `dir`. No I/O happens until [`Queue::open`].
    pub fn new(dir: PathBuf, options: QueueOptions) -> Self {
        Self {
            dir,
            options,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create the directory if missing, open every segment in ID order, and
    /// seed segment #1 when the directory is empty. Idempotent.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;

        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match parse_segment_id(&name) {
                Some(id) => entries.push((id, entry.path())),
                None => {
                    debug!(queue = %self.dir.display(), file = %name, "ignoring non-segment file");
                }
            }
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(entries.len().max(1));
        for (_, path) in entries {
            segments.push(Segment::open(
                path,
                self.options.max_segment_size,
                self.options.sync_interval,
            )?);
        }
        if segments.is_empty() {
            segments.push(Segment::create(
                &self.dir,
                1,
                self.options.max_segment_size,
                self.options.sync_interval,
            )?);
        }

        inner.segments = segments;
        inner.opened = true;
        Ok(())
    }

    /// Append one block to the tail, evicting head segments when the queue
    /// would exceed its maximum size and rolling to a new segment when the
    /// tail is full.
    pub fn append(&self, block: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let framed = RECORD_HEADER_LEN + block.len() as u64;
        if framed > self.options.max_size {
            return Err(Error::QueueFull);
        }

        let mut evicted = 0u64;
        while inner.total_bytes() + framed > self.options.max_size {
            if inner.segments.len() > 1 {
                let head = inner.segments.remove(0);
                head.destroy()?;
                evicted += 1;
            } else if let Some(tail) = inner.segments.pop() {
                // Only the tail remains and the block still does not fit:
                // replace it with a fresh segment.
                let next_id = tail.id() + 1;
                tail.destroy()?;
                evicted += 1;
                inner.segments.push(Segment::create(
                    &self.dir,
                    next_id,
                    self.options.max_segment_size,
                    self.options.sync_interval,
                )?);
                break;
            } else {
                break;
            }
        }
        if evicted > 0 {
            inner.dropped_segments += evicted;
            warn!(
                queue = %self.dir.display(),
                evicted,
                "dropped head segments to stay under the queue size limit"
            );
            telemetry::record_evicted_segments(evicted);
        }

        let needs_roll = match inner.segments.last_mut() {
            Some(tail) => match tail.append(block) {
                Ok(()) => false,
                Err(Error::SegmentFull) => true,
                Err(e) => return Err(e),
            },
            None => true,
        };
        if needs_roll {
            let next_id = inner.segments.last().map(|s| s.id() + 1).unwrap_or(1);
            let mut tail = Segment::create(
                &self.dir,
                next_id,
                self.options.max_segment_size,
                self.options.sync_interval,
            )?;
            tail.append(block)?;
            inner.segments.push(tail);
        }
        Ok(())
    }

    /// Read the block at the head cursor without advancing. A fully drained
    /// head segment is deleted and the read retried on its successor; `Eof`
    /// when no data remains anywhere.
    pub fn current(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        loop {
            let head_is_tail = inner.segments.len() <= 1;
            let head = match inner.segments.first_mut() {
                Some(head) => head,
                None => return Err(Error::Eof),
            };
            match head.current() {
                Err(Error::Eof) if !head_is_tail => {
                    let drained = inner.segments.remove(0);
                    drained.destroy()?;
                }
                other => return other,
            }
        }
    }

    /// Move the head cursor past the current block. A head segment drained
    /// by the advance is deleted unless it is also the tail.
    pub fn advance(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let head_is_tail = inner.segments.len() <= 1;
        let head = match inner.segments.first_mut() {
            Some(head) => head,
            None => return Err(Error::Eof),
        };
        head.advance()?;
        if head.empty() && !head_is_tail {
            let drained = inner.segments.remove(0);
            drained.destroy()?;
        }
        Ok(())
    }

    /// Delete every segment whose mtime is older than `cutoff`, never
    /// touching the active tail. Returns the number of segments deleted.
    pub fn purge_older_than(&self, cutoff: SystemTime) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let mut purged = 0u64;
        let mut i = 0;
        while i + 1 < inner.segments.len() {
            let old = matches!(inner.segments[i].last_modified(), Ok(modified) if modified < cutoff);
            if old {
                let segment = inner.segments.remove(i);
                segment.destroy()?;
                purged += 1;
            } else {
                i += 1;
            }
        }
        telemetry::record_purged_segments(purged);
        Ok(purged)
    }

    /// Unconsumed bytes across all segments.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes()
    }

    /// Number of segments on disk.
    pub fn total_segments(&self) -> u64 {
        self.inner.lock().segments.len() as u64
    }

    /// Head segments dropped by max-size eviction since open.
    pub fn dropped_segments(&self) -> u64 {
        self.inner.lock().dropped_segments
    }

    /// True when no unconsumed data remains.
    pub fn empty(&self) -> bool {
        self.inner.lock().total_bytes() == 0
    }

    /// Head and tail positions for diagnostics.
    pub fn position(&self) -> Result<QueuePosition> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        let head = inner.segments.first().ok_or(Error::NotOpen)?;
        let tail = inner.segments.last().ok_or(Error::NotOpen)?;
        Ok(QueuePosition {
            head: format!("{}:{}", head.path().display(), head.read_off()),
            tail: format!("{}:{}", tail.path().display(), tail.data_len()),
        })
    }

    /// When the queue last received data: the mtime of the tail segment.
    pub fn last_modified(&self) -> Result<SystemTime> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        let tail = inner.segments.last().ok_or(Error::NotOpen)?;
        tail.last_modified()
    }

    /// Close all segments. Idempotent; the files stay on disk.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.opened = false;
        inner.segments.clear();
        Ok(())
    }
}
