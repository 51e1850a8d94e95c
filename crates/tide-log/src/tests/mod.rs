//! Tests for the log crate.

mod log_tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tide_access::{AccessControlList, StaticList};
use tide_crypto::{Keypair, SharedKey};
use tide_store::MemoryStore;
use tide_types::ContentHash;

use crate::cache::{HeadCache, HeadStore};
use crate::error::{LogError, Result};
use crate::fetch::EntryFetcher;
use crate::oplog::{Log, LogContext};

/// Deterministic keypair from a seed.
fn test_keypair(seed: u8) -> Keypair {
    Keypair::from_seed([seed; 32])
}

/// Context for `seed` with `write` granted to every seed in `writers`.
fn test_context(seed: u8, writers: &[u8], shared_key: Option<SharedKey>) -> LogContext {
    let acl = AccessControlList::writers(writers.iter().map(|w| test_keypair(*w).identity().id));
    LogContext {
        keypair: test_keypair(seed),
        access: Arc::new(StaticList::new(acl)),
        shared_key,
        store: Arc::new(MemoryStore::new()),
        cache: Arc::new(HeadCache::in_memory()),
    }
}

/// In-memory log for `seed`, writable by `writers`.
fn test_log(seed: u8, writers: &[u8]) -> Log {
    Log::new("test-log", test_context(seed, writers, None))
}

/// Encrypted in-memory log.
fn encrypted_log(seed: u8, writers: &[u8], key: SharedKey) -> Log {
    Log::new("test-log", test_context(seed, writers, Some(key)))
}

/// Head store whose writes fail while `failing` is set.
struct FlakyHeads {
    inner: HeadCache,
    failing: AtomicBool,
}

impl FlakyHeads {
    fn new() -> Self {
        Self {
            inner: HeadCache::in_memory(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HeadStore for FlakyHeads {
    fn load(&self, log_id: &str) -> Result<Vec<ContentHash>> {
        self.inner.load(log_id)
    }

    fn store(&self, log_id: &str, heads: &[ContentHash]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogError::Cache("no space left on device".to_string()));
        }
        self.inner.store(log_id, heads)
    }
}

/// In-memory log for `seed` whose head writes can be made to fail.
fn flaky_log(seed: u8, writers: &[u8]) -> (Log, Arc<FlakyHeads>) {
    let heads = Arc::new(FlakyHeads::new());
    let ctx = LogContext {
        cache: heads.clone(),
        ..test_context(seed, writers, None)
    };
    (Log::new("test-log", ctx), heads)
}

/// Values of a listing, as strings.
fn values(records: &[crate::entry::Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(r.value()).into_owned())
        .collect()
}

/// Serves a fixed set of blobs; counts calls.
struct MapFetcher {
    blobs: HashMap<ContentHash, Vec<u8>>,
    calls: AtomicUsize,
}

impl MapFetcher {
    fn from_log(log: &Log) -> Self {
        let all = log.collect_for_peer(&log.heads(), &[], usize::MAX).unwrap();
        let blobs = all
            .into_iter()
            .map(|b| (ContentHash::from_data(&b), b))
            .collect();
        Self {
            blobs,
            calls: AtomicUsize::new(0),
        }
    }

    fn without(mut self, hash: &ContentHash) -> Self {
        self.blobs.remove(hash);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EntryFetcher for MapFetcher {
    async fn fetch(&self, hashes: &[ContentHash], _have: &[ContentHash]) -> Result<Vec<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(hashes
            .iter()
            .filter_map(|h| self.blobs.get(h).cloned())
            .collect())
    }
}

/// Always fails with the given error.
struct FailingFetcher {
    cancelled: bool,
}

#[async_trait::async_trait]
impl EntryFetcher for FailingFetcher {
    async fn fetch(&self, _hashes: &[ContentHash], _have: &[ContentHash]) -> Result<Vec<Vec<u8>>> {
        if self.cancelled {
            Err(LogError::Cancelled)
        } else {
            Err(LogError::Fetch("peer unreachable".to_string()))
        }
    }
}
