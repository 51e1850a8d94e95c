//! Error types for the log crate.

use tide_access::AccessError;
use tide_crypto::CryptoError;
use tide_store::StoreError;

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The local identity may not append to this log.
    #[error(transparent)]
    AccessDenied(#[from] AccessError),

    /// A payload or entry could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Entry signature verification failed.
    #[error("invalid entry signature: {0}")]
    InvalidSignature(String),

    /// Payload decryption failed (wrong or missing key).
    #[error("payload decryption failed")]
    Decryption,

    /// Entry bytes are not the canonical encoding of the entry.
    #[error("invalid entry hash")]
    InvalidHash,

    /// Content store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Head cache error.
    #[error("head cache error: {0}")]
    Cache(String),

    /// Fetching entries from elsewhere failed.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<postcard::Error> for LogError {
    fn from(e: postcard::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<CryptoError> for LogError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Decryption => Self::Decryption,
            CryptoError::InvalidSignature(msg) => Self::InvalidSignature(msg),
            other => Self::Encoding(other.to_string()),
        }
    }
}

/// Convenience alias for log results.
pub type Result<T> = std::result::Result<T, LogError>;
