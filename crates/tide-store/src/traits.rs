//! Core trait for content-addressable storage.

use bytes::Bytes;
use tide_types::ContentHash;

use crate::error::StoreError;

/// Content-addressable blob storage.
///
/// Blobs are keyed by `ContentHash::from_data(bytes)`. Storing the same bytes
/// twice is a no-op that returns the same hash. Implementations must be
/// `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its hash.
    async fn put(&self, data: Bytes) -> Result<ContentHash, StoreError>;

    /// Retrieve a blob by hash. Returns `None` if not found.
    async fn get(&self, hash: ContentHash) -> Result<Option<Bytes>, StoreError>;

    /// Check whether a blob exists.
    async fn contains(&self, hash: ContentHash) -> Result<bool, StoreError>;

    /// List all stored hashes.
    async fn list(&self) -> Result<Vec<ContentHash>, StoreError>;

    /// Retrieve a blob that must exist.
    async fn get_required(&self, hash: ContentHash) -> Result<Bytes, StoreError> {
        self.get(hash).await?.ok_or(StoreError::NotFound(hash))
    }
}
