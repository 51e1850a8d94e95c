//! In-memory content storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use tide_types::ContentHash;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::ContentStore;

/// In-memory content store backed by a `RwLock<HashMap>`.
///
/// Used by tests and by nodes configured without a data directory.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<ContentHash, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a reference to the inner map (for testing purposes).
    #[cfg(test)]
    pub(crate) fn inner(&self) -> &RwLock<HashMap<ContentHash, Bytes>> {
        &self.blobs
    }
}

#[async_trait::async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, data: Bytes) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::from_data(&data);
        let mut map = self.blobs.write().expect("lock poisoned");
        if !map.contains_key(&hash) {
            debug!(%hash, size = data.len(), "storing blob in memory");
            map.insert(hash, data);
        }
        Ok(hash)
    }

    async fn get(&self, hash: ContentHash) -> Result<Option<Bytes>, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        match map.get(&hash) {
            Some(data) => {
                let actual = ContentHash::from_data(data);
                if actual != hash {
                    return Err(StoreError::Corrupt {
                        expected: hash,
                        actual,
                    });
                }
                Ok(Some(data.clone()))
            }
            None => Ok(None),
        }
    }

    async fn contains(&self, hash: ContentHash) -> Result<bool, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.contains_key(&hash))
    }

    async fn list(&self) -> Result<Vec<ContentHash>, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.keys().copied().collect())
    }
}
