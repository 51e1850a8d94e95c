//! Head persistence (Fjall disk or pure in-memory).
//!
//! The entries themselves live in the content store; the cache only has to
//! remember each log's current heads so the log can be rebuilt on open.
//! Logs talk to it through the [`HeadStore`] trait.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tide_types::ContentHash;

use crate::error::{LogError, Result};

enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        heads: Keyspace,
    },
    Memory(RwLock<HashMap<[u8; 32], Vec<ContentHash>>>),
}

/// Durable per-log head sets.
///
/// A log writes its heads here before a change becomes visible, so a
/// failed write leaves the log as it was.
pub trait HeadStore: Send + Sync {
    /// Heads last stored for `log_id` (empty if none).
    fn load(&self, log_id: &str) -> Result<Vec<ContentHash>>;

    /// Replace the stored heads of `log_id`.
    fn store(&self, log_id: &str, heads: &[ContentHash]) -> Result<()>;
}

/// Per-log head sets, keyed by log id.
///
/// One cache is shared by every log of a node.
pub struct HeadCache {
    backend: Backend,
}

fn cache_err(e: impl std::fmt::Display) -> LogError {
    LogError::Cache(e.to_string())
}

/// Cache key for a log id.
fn log_key(log_id: &str) -> [u8; 32] {
    blake3::hash(log_id.as_bytes()).into()
}

impl HeadCache {
    /// Open a persistent cache at the given path (Fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(cache_err)?;
        let heads = db
            .keyspace("log_heads", KeyspaceCreateOptions::default)
            .map_err(cache_err)?;
        Ok(Self {
            backend: Backend::Fjall { db, heads },
        })
    }

    /// Create a pure in-memory cache.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
        }
    }

    fn load_heads(&self, log_id: &str) -> Result<Vec<ContentHash>> {
        let key = log_key(log_id);
        match &self.backend {
            Backend::Fjall { heads, .. } => match heads.get(key).map_err(cache_err)? {
                Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
                None => Ok(Vec::new()),
            },
            Backend::Memory(m) => Ok(m
                .read()
                .expect("lock poisoned")
                .get(&key)
                .cloned()
                .unwrap_or_default()),
        }
    }

    fn store_heads(&self, log_id: &str, heads: &[ContentHash]) -> Result<()> {
        let key = log_key(log_id);
        match &self.backend {
            Backend::Fjall { heads: ks, .. } => {
                let bytes = postcard::to_allocvec(heads)?;
                ks.insert(key, bytes).map_err(cache_err)?;
            }
            Backend::Memory(m) => {
                m.write()
                    .expect("lock poisoned")
                    .insert(key, heads.to_vec());
            }
        }
        Ok(())
    }
}

impl HeadStore for HeadCache {
    fn load(&self, log_id: &str) -> Result<Vec<ContentHash>> {
        self.load_heads(log_id)
    }

    fn store(&self, log_id: &str, heads: &[ContentHash]) -> Result<()> {
        self.store_heads(log_id, heads)
    }
}
