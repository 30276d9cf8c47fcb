//! Cluster metadata client interface.

use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Information about a data node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID (unique identifier)
    pub id: u64,
    /// Address the node accepts shard writes on
    pub addr: SocketAddr,
}

impl NodeInfo {
    /// Create a new node info
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Metadata client interface.
///
/// This trait abstracts the cluster metadata store. The handoff worker uses
/// it to decide whether a target node is still worth replaying to.
#[async_trait]
pub trait MetaClient: Send + Sync {
    /// Look up a data node by ID.
    ///
    /// Returns `Ok(None)` when the node is not currently a cluster member
    /// (the worker pauses), and `Err(Error::NodeNotFound)` when the node has
    /// been permanently removed (the worker exits).
    async fn data_node(&self, id: u64) -> Result<Option<NodeInfo>>;
}

/// Local in-memory metadata client.
///
/// This implementation stores the node table in memory and is suitable for
/// development, testing, and single-node deployments.
#[derive(Debug, Default)]
pub struct LocalMetaClient {
    /// Current cluster members by node ID
    nodes: DashMap<u64, NodeInfo>,
    /// Nodes that have been permanently removed
    removed: RwLock<HashSet<u64>>,
}

impl LocalMetaClient {
    /// Create a new local metadata client
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a cluster member.
    pub fn register_node(&self, node: NodeInfo) {
        self.removed.write().remove(&node.id);
        self.nodes.insert(node.id, node);
    }

    /// Mark a node as temporarily absent. `data_node` returns `Ok(None)`.
    pub fn deregister_node(&self, id: u64) {
        self.nodes.remove(&id);
    }

    /// Permanently remove a node. `data_node` returns `Err(NodeNotFound)`.
    pub fn remove_node(&self, id: u64) {
        self.nodes.remove(&id);
        self.removed.write().insert(id);
    }
}

#[async_trait]
impl MetaClient for LocalMetaClient {
    async fn data_node(&self, id: u64) -> Result<Option<NodeInfo>> {
        if self.removed.read().contains(&id) {
            return Err(Error::NodeNotFound(id));
        }
        Ok(self.nodes.get(&id).map(|n| n.value().clone()))
    }
}
