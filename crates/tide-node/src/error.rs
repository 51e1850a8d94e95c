//! Error types for the node facade.

use tide_types::events::BusError;

/// Errors returned by [`Node`](crate::Node) and
/// [`EventLogStore`](crate::EventLogStore).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A log address could not be parsed or its manifest not found.
    #[error("cannot resolve log address: {0}")]
    AddressResolution(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A manifest could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Log operation failed.
    #[error("log error: {0}")]
    Log(#[from] tide_log::LogError),

    /// Content store error.
    #[error("store error: {0}")]
    Store(#[from] tide_store::StoreError),

    /// Transport failure.
    #[error("network error: {0}")]
    Net(#[from] tide_net::NetError),

    /// Replication coordinator error.
    #[error("replication error: {0}")]
    Replication(#[from] tide_replication::ReplicationError),

    /// Event subscription error.
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<postcard::Error> for NodeError {
    fn from(e: postcard::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convenience alias for node results.
pub type Result<T> = std::result::Result<T, NodeError>;
