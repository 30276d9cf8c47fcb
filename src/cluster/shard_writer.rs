//! Shard writer interface.

use crate::points::Point;
use crate::Result;
use async_trait::async_trait;

/// Sends a decoded batch of points to a shard on a remote data node.
///
/// The handoff worker drains its queue through this seam. Implementations
/// are expected to fan out internally and to surface
/// `Error::NodeNotFound` when the target node has been removed from the
/// cluster; any other error is treated as retryable.
#[async_trait]
pub trait ShardWriter: Send + Sync {
    /// Write `points` to `shard_id` on the node identified by `node_id`.
    async fn write_shard(&self, shard_id: u64, node_id: u64, points: &[Point]) -> Result<()>;
}
