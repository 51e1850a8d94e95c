//! Error types for the replication coordinator.

/// Errors surfaced by [`Replicator`](crate::Replicator) calls.
///
/// Failures inside the background tasks are logged and counted in
/// [`ReplicationStats`](crate::ReplicationStats) instead.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Log operation failed.
    #[error("log error: {0}")]
    Log(#[from] tide_log::LogError),

    /// Transport failure.
    #[error("network error: {0}")]
    Net(#[from] tide_net::NetError),

    /// The replicator has been shut down.
    #[error("replicator shut down")]
    ShutDown,
}

/// Convenience alias for replication results.
pub type Result<T> = std::result::Result<T, ReplicationError>;
