//! Error types for content storage operations.

use tide_types::ContentHash;

/// Errors that can occur during content storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob was not found.
    #[error("content not found: {0}")]
    NotFound(ContentHash),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes do not hash to the key they are stored under.
    #[error("content corruption detected: expected {expected}, actual hash {actual}")]
    Corrupt {
        /// The hash that was requested.
        expected: ContentHash,
        /// The hash computed from the bytes actually stored.
        actual: ContentHash,
    },
}
