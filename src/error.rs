//! Error handling for the Argosy allocator

use thiserror::Error;

/// Result type for allocator operations
pub type Result<T> = std::result::Result<T, ArgosyError>;

/// Main error type for the Argosy allocator
#[derive(Error, Debug)]
pub enum ArgosyError {
    /// No volume in the pool can satisfy the request right now.
    /// Callers should retry; a refill has already been signaled.
    #[error("no available volume")]
    NoAvailableVolume,

    /// The blob-id space backing the BID manager is exhausted
    #[error("bid space exhausted")]
    BidExhausted,

    /// Operation invoked after the allocator was closed
    #[error("allocator is closed")]
    Closed,

    /// Caller-initiated cancellation observed mid-operation
    #[error("operation canceled")]
    Canceled,

    /// Misconfiguration discovered at construction; fatal to startup
    #[error("cluster manager config: {0}")]
    Config(String),

    /// Cluster manager RPC failure; absorbed by background retry loops
    #[error("cluster manager rpc: {0}")]
    ClusterMgr(String),

    /// Invalid caller-supplied argument
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
}
