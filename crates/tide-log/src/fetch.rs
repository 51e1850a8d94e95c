//! Sources of remote entries for [`Log::merge`](crate::Log::merge).

use std::sync::Arc;

use tide_store::ContentStore;
use tide_types::ContentHash;

use crate::error::Result;
use crate::oplog::Log;

/// Something that can hand out canonical entry bytes by hash.
///
/// A fetch may return fewer entries than asked for, or extra ancestors of
/// the requested ones; the caller verifies every returned blob against the
/// hashes it actually needs. `have` lists hashes the caller already holds so
/// the source can stop walking there.
#[async_trait::async_trait]
pub trait EntryFetcher: Send + Sync {
    async fn fetch(&self, hashes: &[ContentHash], have: &[ContentHash]) -> Result<Vec<Vec<u8>>>;
}

/// Fetches entries from a content store.
///
/// Used to rebuild a log from its cached heads on open.
pub struct StoreFetcher {
    store: Arc<dyn ContentStore>,
}

impl StoreFetcher {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl EntryFetcher for StoreFetcher {
    async fn fetch(&self, hashes: &[ContentHash], _have: &[ContentHash]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(bytes) = self.store.get(*hash).await? {
                out.push(bytes.to_vec());
            }
        }
        Ok(out)
    }
}

/// A log serves its own entries, walking back from the requested hashes.
#[async_trait::async_trait]
impl EntryFetcher for Log {
    async fn fetch(&self, hashes: &[ContentHash], have: &[ContentHash]) -> Result<Vec<Vec<u8>>> {
        self.collect_for_peer(hashes, have, usize::MAX)
    }
}
