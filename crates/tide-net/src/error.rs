//! Error types for network operations.

use std::time::Duration;

use tide_types::PeerId;

/// Errors that can occur during network operations.
///
/// None of these are fatal to a log: the replication coordinator retries
/// or gives up on the affected fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// The remote peer is not reachable on this channel.
    #[error("peer unreachable: {0}")]
    Unreachable(PeerId),

    /// No response arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote peer dropped the request without answering.
    #[error("no response from {0}")]
    NoResponse(PeerId),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Binding the local endpoint failed.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// Failed to connect to a remote endpoint.
    #[error("connection error: {0}")]
    Connect(String),

    /// Failed to open a stream.
    #[error("stream open error: {0}")]
    StreamOpen(String),

    /// Reading or writing a stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The gossip layer refused an operation.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// An encoded message exceeds the size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        Self::Stream(e.to_string())
    }
}

impl From<iroh_gossip::api::ApiError> for NetError {
    fn from(e: iroh_gossip::api::ApiError) -> Self {
        Self::Gossip(e.to_string())
    }
}

impl From<postcard::Error> for NetError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
