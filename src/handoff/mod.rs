//! Hinted-handoff service: the per-node processor registry.
//!
//! The service owns one [`NodeProcessor`] per target data node, routes
//! incoming hinted writes to the right processor (creating it on demand),
//! and periodically reaps processors whose target node has been removed from
//! the cluster and whose queues have drained.

mod processor;

pub use processor::{marshal_write, unmarshal_write, NodeProcessor, Statistic};

use crate::cluster::{MetaClient, ShardWriter};
use crate::points::Point;
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ProcessorMap = Arc<RwLock<HashMap<u64, Arc<NodeProcessor>>>>;

/// Per-node queue state for diagnostics.
#[derive(Debug, Clone)]
pub struct NodeDiagnostics {
    pub node_id: u64,
    /// Whether the target node is currently a cluster member.
    pub active: bool,
    pub queue_bytes: u64,
    pub queue_segments: u64,
    pub head: String,
    pub tail: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ServiceState {
    shutdown: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

impl ServiceState {
    fn is_open(&self) -> bool {
        matches!(&self.shutdown, Some(token) if !token.is_cancelled())
    }
}

/// Process-wide hinted-handoff supervisor.
///
/// Constructed, opened, and closed by the host; there are no ambient
/// singletons.
pub struct Service {
    config: Config,
    writer: Arc<dyn ShardWriter>,
    meta: Arc<dyn MetaClient>,
    processors: ProcessorMap,
    state: RwLock<ServiceState>,
}

impl Service {
    /// Create a new service. No I/O happens until [`Service::open`].
    pub fn new(config: Config, writer: Arc<dyn ShardWriter>, meta: Arc<dyn MetaClient>) -> Self {
        Self {
            config,
            writer,
            meta,
            processors: Arc::new(RwLock::new(HashMap::new())),
            state: RwLock::new(ServiceState::default()),
        }
    }

    /// Open the service: adopt every existing queue directory under the base
    /// dir and start the supervisor. A no-op when the subsystem is disabled.
    /// Idempotent.
    pub async fn open(&self) -> Result<()> {
        if !self.config.enabled {
            info!("hinted handoff is disabled");
            return Ok(());
        }
        self.config.validate()?;

        let mut state = self.state.write().await;
        if state.is_open() {
            return Ok(());
        }

        info!(path = %self.config.dir.display(), "starting hinted handoff service");
        std::fs::create_dir_all(&self.config.dir)?;

        for entry in std::fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Ok(node_id) = name.parse::<u64>() else {
                warn!(dir = %name, "skipping non-numeric queue directory");
                continue;
            };
            let processor = Arc::new(NodeProcessor::new(
                node_id,
                entry.path(),
                Arc::clone(&self.writer),
                Arc::clone(&self.meta),
                self.config.clone(),
            ));
            processor.open().await?;
            self.processors.write().await.insert(node_id, processor);
        }

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(run_supervisor(
            self.config.clone(),
            Arc::clone(&self.processors),
            shutdown.clone(),
        ));
        state.shutdown = Some(shutdown);
        state.supervisor = Some(supervisor);
        Ok(())
    }

    /// Stop the supervisor and close every processor. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (shutdown, supervisor) = {
            let mut state = self.state.write().await;
            (state.shutdown.take(), state.supervisor.take())
        };
        if let Some(shutdown) = shutdown {
            shutdown.cancel();
            if let Some(supervisor) = supervisor {
                let _ = supervisor.await;
            }
        }

        let processors: Vec<Arc<NodeProcessor>> =
            self.processors.read().await.values().cloned().collect();
        let mut result = Ok(());
        for processor in processors {
            if let Err(e) = processor.close().await {
                warn!(
                    node_id = processor.node_id(),
                    error = %e,
                    "failed to close hinted-handoff processor"
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Enqueue a hinted write of `points` for `shard_id` on `node_id`.
    ///
    /// Whether the target node currently exists in the cluster metadata is
    /// deliberately not checked here; the worker decides activity.
    pub async fn write_shard_hinted(
        &self,
        node_id: u64,
        shard_id: u64,
        points: &[Point],
    ) -> Result<()> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }
        if !self.state.read().await.is_open() {
            return Err(Error::Closed);
        }
        let processor = self.processor_for(node_id).await?;
        processor.write_shard(shard_id, points).await
    }

    /// Find the processor for `node_id`, creating or reopening it on demand.
    async fn processor_for(&self, node_id: u64) -> Result<Arc<NodeProcessor>> {
        if let Some(processor) = self.processors.read().await.get(&node_id) {
            if !processor.closed().await {
                return Ok(Arc::clone(processor));
            }
        }

        let mut processors = self.processors.write().await;
        let processor = match processors.get(&node_id) {
            Some(existing) => Arc::clone(existing),
            None => {
                let processor = Arc::new(NodeProcessor::new(
                    node_id,
                    self.config.node_dir(node_id),
                    Arc::clone(&self.writer),
                    Arc::clone(&self.meta),
                    self.config.clone(),
                ));
                processors.insert(node_id, Arc::clone(&processor));
                processor
            }
        };
        // Restarts a processor whose worker exited after node removal.
        processor.open().await?;
        Ok(processor)
    }

    /// True when the queue for `node_id` is empty or no processor exists.
    pub async fn empty(&self, node_id: u64) -> bool {
        let processor = self.processors.read().await.get(&node_id).cloned();
        match processor {
            Some(processor) => processor.empty().await,
            None => true,
        }
    }

    /// Union of per-processor statistics.
    pub async fn statistics(&self, tags: &HashMap<String, String>) -> Vec<Statistic> {
        let processors: Vec<Arc<NodeProcessor>> =
            self.processors.read().await.values().cloned().collect();
        processors
            .iter()
            .map(|processor| processor.statistics(tags))
            .collect()
    }

    /// Per-node queue state, ordered by node ID.
    pub async fn diagnostics(&self) -> Vec<NodeDiagnostics> {
        let mut processors: Vec<(u64, Arc<NodeProcessor>)> = self
            .processors
            .read()
            .await
            .iter()
            .map(|(id, processor)| (*id, Arc::clone(processor)))
            .collect();
        processors.sort_by_key(|(id, _)| *id);

        let mut rows = Vec::with_capacity(processors.len());
        for (node_id, processor) in processors {
            rows.push(NodeDiagnostics {
                node_id,
                active: processor.active().await.unwrap_or(false),
                queue_bytes: processor.queue_bytes().await,
                queue_segments: processor.queue_segments().await,
                head: processor.head().await,
                tail: processor.tail().await,
                last_modified: processor.last_modified().await.ok(),
            });
        }
        rows
    }
}

/// Supervisor loop: every purge interval, reap processors whose target node
/// has left the cluster for good.
async fn run_supervisor(config: Config, processors: ProcessorMap, shutdown: CancellationToken) {
    let start = tokio::time::Instant::now() + config.purge_interval;
    let mut tick = tokio::time::interval_at(start, config.purge_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("hinted-handoff supervisor stopping");
                return;
            }
            _ = tick.tick() => {
                reap_removed_nodes(&config, &processors).await;
            }
        }
    }
}

/// Close and purge every processor whose target node is absent from the
/// cluster metadata, whose queue is empty, and whose data is older than the
/// maximum age. Segment-level purging stays with the processors' own purge
/// timers.
async fn reap_removed_nodes(config: &Config, processors: &RwLock<HashMap<u64, Arc<NodeProcessor>>>) {
    let snapshot: Vec<(u64, Arc<NodeProcessor>)> = processors
        .read()
        .await
        .iter()
        .map(|(id, processor)| (*id, Arc::clone(processor)))
        .collect();

    for (node_id, processor) in snapshot {
        let absent = match processor.active().await {
            Ok(active) => !active,
            Err(e) if e.is_node_not_found() => true,
            Err(e) => {
                warn!(node_id, error = %e, "cannot check cluster membership");
                continue;
            }
        };
        if !absent || !processor.queue_empty().await {
            continue;
        }
        let last_modified = match processor.last_modified().await {
            Ok(last_modified) => last_modified,
            Err(_) => continue,
        };
        let age = Utc::now()
            .signed_duration_since(last_modified)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < config.max_age {
            continue;
        }

        // Hold the registry lock across close/purge/remove so a concurrent
        // hinted write cannot revive the processor while its directory is
        // being deleted.
        let mut registry = processors.write().await;
        info!(node_id, "reaping hinted-handoff queue for removed node");
        if let Err(e) = processor.close().await {
            warn!(node_id, error = %e, "failed to close reaped processor");
            continue;
        }
        if let Err(e) = processor.purge().await {
            warn!(node_id, error = %e, "failed to purge reaped processor");
            continue;
        }
        registry.remove(&node_id);
    }
}
