//! Error types for driftq

/// Result type alias for driftq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for driftq
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Hinted handoff is disabled by configuration
    #[error("hinted handoff is disabled")]
    Disabled,
    /// Operation invoked on a closed processor or service
    #[error("hinted handoff is closed")]
    Closed,
    /// Purge invoked while the processor is still open
    #[error("node processor is open")]
    Open,
    /// Queue operation before `open`
    #[error("queue is not open")]
    NotOpen,
    /// Block does not fit in the queue even after head eviction
    #[error("queue is full")]
    QueueFull,
    /// Segment has reached its maximum size; the queue rolls over
    #[error("segment is full")]
    SegmentFull,
    /// End of queue; internal sentinel, collapses to "wait" in the worker loop
    #[error("end of queue")]
    Eof,
    /// The target data node has been removed from the cluster
    #[error("data node {0} not found")]
    NodeNotFound(u64),
    /// A block or point could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
    /// Segment file name is not a valid segment ID
    #[error("invalid segment file name: {0}")]
    InvalidSegment(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the internal end-of-queue sentinel.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// True when the target node has been permanently removed.
    pub fn is_node_not_found(&self) -> bool {
        matches!(self, Error::NodeNotFound(_))
    }
}
