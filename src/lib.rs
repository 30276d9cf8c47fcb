//! # driftq
//!
//! Durable hinted handoff for a clustered time-series database.
//!
//! When a coordinator cannot reach the data node that owns a shard, driftq
//! queues the write on local disk and replays it once the node is reachable
//! again, guaranteeing at-least-once delivery without blocking the write
//! path.
//!
//! ## Key Properties
//!
//! - **Durable, bounded queues**: one segmented on-disk queue per target
//!   node, with crash recovery and head eviction when a queue outgrows its
//!   size limit
//! - **Independent replay**: one worker per target node with adaptive
//!   backoff, age-based purging, and an egress rate limit
//! - **Cluster aware**: workers pause while their target is absent from the
//!   cluster metadata and exit when it is permanently removed
//!
//! ## Architecture
//!
//! - **Segment**: a single append-only file of length-prefixed blocks plus a
//!   persisted read cursor
//! - **Queue**: an ordered sequence of segments under one directory
//! - **NodeProcessor**: queue plus worker for one target data node
//! - **Service**: the per-node processor registry behind
//!   `write_shard_hinted`

pub mod cluster;
pub mod config;
pub mod handoff;
pub mod points;
pub mod queue;
pub mod rate_limit;
pub mod telemetry;

mod error;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{LocalMetaClient, MetaClient, NodeInfo, ShardWriter};
    pub use crate::handoff::{NodeProcessor, Service};
    pub use crate::points::Point;
    pub use crate::{Config, Error, Result};
}
