//! Per-node hinted-handoff processor.
//!
//! A `NodeProcessor` encapsulates the queue of hinted-handoff data for one
//! target data node and the transmission of that data to the node. Producers
//! append through [`NodeProcessor::write_shard`]; a single worker task drains
//! the queue through the shard writer with retry, backoff, age-based purge,
//! and an egress rate limit.

use crate::cluster::{MetaClient, ShardWriter};
use crate::points::{parse_points, Point};
use crate::queue::{Queue, QueueOptions, QueuePosition};
use crate::rate_limit::RateLimiter;
use crate::telemetry;
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHARD_ID_LEN: usize = 8;

pub(crate) const STAT_WRITE_SHARD_REQ: &str = "writeShardReq";
pub(crate) const STAT_WRITE_SHARD_REQ_POINTS: &str = "writeShardReqPoints";
pub(crate) const STAT_WRITE_NODE_REQ: &str = "writeNodeReq";
pub(crate) const STAT_WRITE_NODE_REQ_POINTS: &str = "writeNodeReqPoints";
pub(crate) const STAT_WRITE_NODE_REQ_FAIL: &str = "writeNodeReqFail";
pub(crate) const STAT_WRITE_DISK_BYTES: &str = "writeDiskBytes";
pub(crate) const STAT_WRITE_DISK_SEGMENTS: &str = "writeDiskSegments";

/// Encode `(shard_id, points)` into one queue block: the shard ID big-endian,
/// then each point's encoding terminated by a newline. Points that cannot be
/// encoded are dropped. A block carrying no points decodes to an empty batch
/// and is never appended by the caller.
pub fn marshal_write(shard_id: u64, points: &[Point]) -> Vec<u8> {
    let mut block = Vec::with_capacity(SHARD_ID_LEN + points.len() * 32);
    block.extend_from_slice(&shard_id.to_be_bytes());
    for point in points {
        if let Ok(encoded) = point.marshal_binary() {
            block.extend_from_slice(&encoded);
            block.push(b'\n');
        }
    }
    block
}

/// Decode a block produced by [`marshal_write`].
pub fn unmarshal_write(block: &[u8]) -> Result<(u64, Vec<Point>)> {
    if block.len() < SHARD_ID_LEN {
        return Err(Error::Decode(format!(
            "block too short for a shard ID: {} bytes",
            block.len()
        )));
    }
    let mut id = [0u8; SHARD_ID_LEN];
    id.copy_from_slice(&block[..SHARD_ID_LEN]);
    let points = parse_points(&block[SHARD_ID_LEN..])?;
    Ok((u64::from_be_bytes(id), points))
}

/// Counters kept by one processor. Updated with relaxed atomics; readers see
/// a consistent value per counter but not across counters.
#[derive(Debug, Default)]
struct Statistics {
    write_shard_req: AtomicU64,
    write_shard_req_points: AtomicU64,
    write_node_req: AtomicU64,
    write_node_req_points: AtomicU64,
    write_node_req_fail: AtomicU64,
    write_disk_bytes: AtomicU64,
    write_disk_segments: AtomicU64,
}

impl Statistics {
    fn update_disk(&self, queue: &Queue) {
        self.write_disk_bytes
            .store(queue.total_bytes(), Ordering::Relaxed);
        self.write_disk_segments
            .store(queue.total_segments(), Ordering::Relaxed);
    }
}

/// A named snapshot of handoff counters with identifying tags.
#[derive(Debug, Clone)]
pub struct Statistic {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub values: HashMap<&'static str, u64>,
}

#[derive(Default)]
struct State {
    queue: Option<Arc<Queue>>,
    shutdown: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl State {
    fn is_open(&self) -> bool {
        matches!(&self.shutdown, Some(token) if !token.is_cancelled())
    }
}

/// Everything the replay path needs; shared between the worker task and the
/// public [`NodeProcessor::send_write`].
#[derive(Clone)]
struct Replayer {
    node_id: u64,
    writer: Arc<dyn ShardWriter>,
    meta: Arc<dyn MetaClient>,
    stats: Arc<Statistics>,
}

impl Replayer {
    async fn active(&self) -> Result<bool> {
        Ok(self.meta.data_node(self.node_id).await?.is_some())
    }

    /// Attempt to send the current block of hinted data to the target node.
    /// See [`NodeProcessor::send_write`] for the contract.
    async fn send_write(&self, queue: &Queue) -> Result<usize> {
        if !self.active().await? {
            return Err(Error::Eof);
        }

        let block = queue.current()?;

        let (shard_id, points) = match unmarshal_write(&block) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats
                    .write_node_req_fail
                    .fetch_add(1, Ordering::Relaxed);
                telemetry::record_replay_failure("decode");
                warn!(
                    node_id = self.node_id,
                    error = %e,
                    "skipping hinted block that cannot be decoded"
                );
                queue.advance()?;
                self.stats.update_disk(queue);
                return Ok(block.len());
            }
        };

        match self
            .writer
            .write_shard(shard_id, self.node_id, &points)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_node_not_found() => return Err(e),
            Err(e) => {
                telemetry::record_replay_failure("write");
                return Err(e);
            }
        }

        self.stats.write_node_req.fetch_add(1, Ordering::Relaxed);
        self.stats
            .write_node_req_points
            .fetch_add(points.len() as u64, Ordering::Relaxed);
        telemetry::record_replay(points.len() as u64);

        queue.advance()?;
        self.stats.update_disk(queue);
        Ok(block.len())
    }

    /// Worker loop: drains the queue to the target node on the retry timer
    /// and purges aged segments on the purge timer. Exits on shutdown or
    /// when the target node has been removed from the cluster.
    async fn run(self, config: Config, queue: Arc<Queue>, shutdown: CancellationToken) {
        let retry_max_interval = config.retry_max_interval;
        let retry_interval = config.retry_interval.min(retry_max_interval);
        let mut current_interval = retry_interval;

        let purge_start = tokio::time::Instant::now() + config.purge_interval;
        let mut purge_tick = tokio::time::interval_at(purge_start, config.purge_interval);
        purge_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut limiter = RateLimiter::new(config.retry_rate_limit);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(node_id = self.node_id, "hinted-handoff worker stopping");
                    return;
                }
                _ = purge_tick.tick() => {
                    let cutoff = SystemTime::now()
                        .checked_sub(config.max_age)
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    match queue.purge_older_than(cutoff) {
                        Ok(purged) if purged > 0 => {
                            info!(
                                node_id = self.node_id,
                                purged,
                                "purged aged hinted-handoff segments"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                node_id = self.node_id,
                                error = %e,
                                "failed to purge hinted-handoff queue"
                            );
                        }
                    }
                }
                _ = tokio::time::sleep(current_interval) => {
                    loop {
                        // An in-flight send may finish, but no new iteration
                        // starts once shutdown is signalled.
                        if shutdown.is_cancelled() {
                            return;
                        }
                        match self.send_write(&queue).await {
                            Ok(sent) => {
                                // Success cancels any backoff.
                                current_interval = retry_interval;
                                limiter.update(sent);
                                let delay = limiter.delay();
                                if !delay.is_zero() {
                                    tokio::select! {
                                        _ = shutdown.cancelled() => return,
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                }
                            }
                            Err(Error::Eof) => {
                                // Queue drained or node inactive.
                                current_interval = retry_interval;
                                break;
                            }
                            Err(e) if e.is_node_not_found() => {
                                info!(
                                    node_id = self.node_id,
                                    "target node removed from cluster, stopping hinted-handoff worker"
                                );
                                shutdown.cancel();
                                return;
                            }
                            Err(e) => {
                                current_interval =
                                    current_interval.saturating_mul(2).min(retry_max_interval);
                                warn!(
                                    node_id = self.node_id,
                                    error = %e,
                                    retry_in = ?current_interval,
                                    "hinted-handoff replay failed"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Queue plus worker for a single target data node.
pub struct NodeProcessor {
    config: Config,
    node_id: u64,
    dir: PathBuf,
    writer: Arc<dyn ShardWriter>,
    meta: Arc<dyn MetaClient>,
    state: RwLock<State>,
    stats: Arc<Statistics>,
}

impl NodeProcessor {
    /// Create a processor for `node_id`, storing hinted data under `dir`.
    pub fn new(
        node_id: u64,
        dir: PathBuf,
        writer: Arc<dyn ShardWriter>,
        meta: Arc<dyn MetaClient>,
        config: Config,
    ) -> Self {
        Self {
            config,
            node_id,
            dir,
            writer,
            meta,
            state: RwLock::new(State::default()),
            stats: Arc::new(Statistics::default()),
        }
    }

    fn replayer(&self) -> Replayer {
        Replayer {
            node_id: self.node_id,
            writer: Arc::clone(&self.writer),
            meta: Arc::clone(&self.meta),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Open the processor: create the queue directory, open the queue, and
    /// start the worker. Idempotent; also restarts a processor whose worker
    /// exited after its target node was removed.
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.is_open() {
            return Ok(());
        }

        // A worker that exited on node removal leaves a cancelled token and
        // an open queue behind; retire both before reopening.
        if let Some(token) = state.shutdown.take() {
            token.cancel();
        }
        if let Some(worker) = state.worker.take() {
            let _ = worker.await;
        }
        if let Some(queue) = state.queue.take() {
            queue.close()?;
        }

        create_node_dir(&self.dir)?;
        let queue = Arc::new(Queue::new(
            self.dir.clone(),
            QueueOptions {
                max_size: self.config.max_size,
                max_segment_size: self.config.max_segment_size,
                sync_interval: self.config.sync_interval,
            },
        ));
        queue.open()?;
        self.stats.update_disk(&queue);

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(self.replayer().run(
            self.config.clone(),
            Arc::clone(&queue),
            shutdown.clone(),
        ));

        state.queue = Some(queue);
        state.shutdown = Some(shutdown);
        state.worker = Some(worker);

        info!(
            node_id = self.node_id,
            path = %self.dir.display(),
            "hinted-handoff processor started"
        );
        Ok(())
    }

    /// Signal shutdown, wait for the worker to exit, and close the queue.
    /// Idempotent. When closed the processor accepts no hinted data.
    pub async fn close(&self) -> Result<()> {
        // Joining the worker while holding the lifecycle lock would deadlock
        // against the worker's own read locks.
        let (shutdown, worker, queue) = {
            let mut state = self.state.write().await;
            (
                state.shutdown.take(),
                state.worker.take(),
                state.queue.take(),
            )
        };
        let Some(shutdown) = shutdown else {
            return Ok(());
        };
        shutdown.cancel();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Some(queue) = queue {
            queue.close()?;
        }
        info!(node_id = self.node_id, "hinted-handoff processor closed");
        Ok(())
    }

    /// True when the processor is not accepting hinted data.
    pub async fn closed(&self) -> bool {
        !self.state.read().await.is_open()
    }

    /// Delete all hinted-handoff data under management by this processor.
    /// The processor must be closed first.
    pub async fn purge(&self) -> Result<()> {
        let state = self.state.write().await;
        if state.is_open() {
            return Err(Error::Open);
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Marshal `(shard_id, points)` and append the block to the queue. A
    /// batch in which no point survives encoding succeeds with no effect.
    pub async fn write_shard(&self, shard_id: u64, points: &[Point]) -> Result<()> {
        let queue = {
            let state = self.state.read().await;
            if !state.is_open() {
                return Err(Error::Closed);
            }
            match &state.queue {
                Some(queue) => Arc::clone(queue),
                None => return Err(Error::Closed),
            }
        };

        self.stats.write_shard_req.fetch_add(1, Ordering::Relaxed);
        self.stats
            .write_shard_req_points
            .fetch_add(points.len() as u64, Ordering::Relaxed);

        let block = marshal_write(shard_id, points);
        if block.len() == SHARD_ID_LEN {
            return Ok(());
        }

        queue.append(&block)?;
        self.stats.update_disk(&queue);
        telemetry::record_enqueue(points.len() as u64, block.len() as u64);
        Ok(())
    }

    /// Attempt to send the current block of hinted data to the target node.
    ///
    /// Returns the number of bytes consumed on success, `Eof` when there is
    /// no more data or the node is inactive, and `NodeNotFound` when the
    /// node has been removed from the cluster. A block that cannot be
    /// decoded is counted as a failure and skipped so it cannot wedge the
    /// queue.
    pub async fn send_write(&self) -> Result<usize> {
        let queue = {
            let state = self.state.read().await;
            match &state.queue {
                Some(queue) => Arc::clone(queue),
                None => return Err(Error::Closed),
            }
        };
        self.replayer().send_write(&queue).await
    }

    /// Whether the target node is currently a cluster member.
    pub async fn active(&self) -> Result<bool> {
        Ok(self.meta.data_node(self.node_id).await?.is_some())
    }

    /// Head of the queue, for diagnostics. Empty when closed.
    pub async fn head(&self) -> String {
        match self.position().await {
            Ok(position) => position.head,
            Err(_) => String::new(),
        }
    }

    /// Tail of the queue, for diagnostics. Empty when closed.
    pub async fn tail(&self) -> String {
        match self.position().await {
            Ok(position) => position.tail,
            Err(_) => String::new(),
        }
    }

    async fn position(&self) -> Result<QueuePosition> {
        let state = self.state.read().await;
        match &state.queue {
            Some(queue) => queue.position(),
            None => Err(Error::Closed),
        }
    }

    /// A closed processor reports non-empty so callers do not mistake it for
    /// a drained one.
    pub async fn empty(&self) -> bool {
        let state = self.state.read().await;
        if !state.is_open() {
            return false;
        }
        state
            .queue
            .as_ref()
            .map(|queue| queue.empty())
            .unwrap_or(false)
    }

    /// Queue emptiness regardless of lifecycle state; used by the reaper,
    /// which must see through a worker that exited on node removal.
    pub(crate) async fn queue_empty(&self) -> bool {
        let state = self.state.read().await;
        state
            .queue
            .as_ref()
            .map(|queue| queue.empty())
            .unwrap_or(true)
    }

    pub(crate) async fn queue_bytes(&self) -> u64 {
        let state = self.state.read().await;
        state
            .queue
            .as_ref()
            .map(|queue| queue.total_bytes())
            .unwrap_or(0)
    }

    pub(crate) async fn queue_segments(&self) -> u64 {
        let state = self.state.read().await;
        state
            .queue
            .as_ref()
            .map(|queue| queue.total_segments())
            .unwrap_or(0)
    }

    /// When the processor last received hinted-handoff data, in UTC.
    pub async fn last_modified(&self) -> Result<DateTime<Utc>> {
        let state = self.state.read().await;
        let queue = state.queue.as_ref().ok_or(Error::Closed)?;
        Ok(DateTime::<Utc>::from(queue.last_modified()?))
    }

    /// The target node's ID.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// The queue directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the processor counters, merging `tags` over the default
    /// `node_id`/`path` tags.
    pub fn statistics(&self, tags: &HashMap<String, String>) -> Statistic {
        let mut merged = HashMap::new();
        merged.insert("node_id".to_string(), self.node_id.to_string());
        merged.insert("path".to_string(), self.dir.display().to_string());
        for (key, value) in tags {
            merged.insert(key.clone(), value.clone());
        }

        let mut values = HashMap::new();
        values.insert(
            STAT_WRITE_SHARD_REQ,
            self.stats.write_shard_req.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_SHARD_REQ_POINTS,
            self.stats.write_shard_req_points.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_NODE_REQ,
            self.stats.write_node_req.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_NODE_REQ_POINTS,
            self.stats.write_node_req_points.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_NODE_REQ_FAIL,
            self.stats.write_node_req_fail.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_DISK_BYTES,
            self.stats.write_disk_bytes.load(Ordering::Relaxed),
        );
        values.insert(
            STAT_WRITE_DISK_SEGMENTS,
            self.stats.write_disk_segments.load(Ordering::Relaxed),
        );

        Statistic {
            name: "handoff_processor".to_string(),
            tags: merged,
            values,
        }
    }
}

fn create_node_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_write_round_trip() {
        let points = vec![
            Point::new("cpu,host=a", "usage=0.5", 10),
            Point::new("cpu,host=b", "usage=0.9", 20),
        ];
        let block = marshal_write(7, &points);
        assert_eq!(&block[..8], 7u64.to_be_bytes().as_slice());

        let (shard_id, decoded) = unmarshal_write(&block).unwrap();
        assert_eq!(shard_id, 7);
        assert_eq!(decoded, points);
    }

    #[test]
    fn marshal_write_drops_unencodable_points() {
        let points = vec![
            Point::new("cpu", "v=1", 1),
            Point::new("bad series", "v=2", 2),
            Point::new("mem", "v=3", 3),
        ];
        let block = marshal_write(1, &points);
        let (_, decoded) = unmarshal_write(&block).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].series(), "cpu");
        assert_eq!(decoded[1].series(), "mem");
    }

    #[test]
    fn marshal_write_of_unencodable_batch_is_bare_shard_id() {
        let points = vec![Point::new("bad series", "v=1", 1)];
        let block = marshal_write(3, &points);
        assert_eq!(block.len(), 8);
    }

    #[test]
    fn unmarshal_write_rejects_short_blocks() {
        let err = unmarshal_write(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn unmarshal_write_rejects_corrupt_points() {
        let mut block = 9u64.to_be_bytes().to_vec();
        block.extend_from_slice(b"garbage\n");
        assert!(unmarshal_write(&block).is_err());
    }
}
