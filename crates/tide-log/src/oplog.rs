//! Core log implementation: local appends, listing and the responder walk.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tide_access::{AccessController, OperationKind};
use tide_crypto::{Identity, Keypair, SharedKey};
use tide_store::ContentStore;
use tide_types::{ContentHash, LamportClock};
use tracing::{debug, info, warn};

use crate::cache::HeadStore;
use crate::entry::{Entry, Operation, Record};
use crate::error::{LogError, Result};
use crate::fetch::StoreFetcher;

/// Everything a log needs besides its id.
#[derive(Clone)]
pub struct LogContext {
    /// Local writer identity.
    pub keypair: Keypair,
    /// Write policy, checked on append and on merge.
    pub access: Arc<dyn AccessController>,
    /// Payload encryption key, if the log is encrypted.
    pub shared_key: Option<SharedKey>,
    /// Durable entry storage.
    pub store: Arc<dyn ContentStore>,
    /// Head persistence.
    pub cache: Arc<dyn HeadStore>,
}

/// How many entries [`Log::list`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Amount {
    /// The whole log.
    #[default]
    All,
    /// At most this many of the newest entries.
    Limit(usize),
}

impl From<i64> for Amount {
    /// Any negative value (conventionally `-1`) means the whole log.
    fn from(n: i64) -> Self {
        if n < 0 {
            Amount::All
        } else {
            Amount::Limit(n as usize)
        }
    }
}

/// Output order of [`Log::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

/// Options for [`Log::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub amount: Amount,
    pub direction: Direction,
}

impl ListOptions {
    /// The whole log, oldest first.
    pub fn all() -> Self {
        Self::default()
    }

    /// The newest `n` entries, oldest first.
    pub fn last(n: usize) -> Self {
        Self {
            amount: Amount::Limit(n),
            direction: Direction::Forward,
        }
    }

    /// Same selection, newest first.
    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }
}

/// Mutable state of a log. Only touched under [`Log::state`].
pub(crate) struct LogState {
    pub(crate) entries: HashMap<ContentHash, Record>,
    pub(crate) heads: BTreeSet<ContentHash>,
    /// Entries that failed verification, and everything built on them.
    pub(crate) rejected: HashSet<ContentHash>,
    /// Local clock, merged with every accepted entry's clock.
    pub(crate) clock: LamportClock,
}

impl LogState {
    fn new(owner: &str) -> Self {
        Self {
            entries: HashMap::new(),
            heads: BTreeSet::new(),
            rejected: HashSet::new(),
            clock: LamportClock::new(owner, 0),
        }
    }

    /// Insert an entry whose predecessors are all present.
    pub(crate) fn insert(&mut self, record: Record) {
        for pred in &record.entry.predecessors {
            self.heads.remove(pred);
        }
        self.heads.insert(record.hash());
        self.clock = self.clock.merge(&record.entry.clock);
        self.entries.insert(record.hash(), record);
    }

    /// Heads once `records` are inserted, without inserting them.
    pub(crate) fn heads_after<'a>(
        &self,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Vec<ContentHash> {
        let mut heads = self.heads.clone();
        for record in records {
            for pred in &record.entry.predecessors {
                heads.remove(pred);
            }
            heads.insert(record.hash());
        }
        heads.into_iter().collect()
    }

    pub(crate) fn knows(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }
}

/// A replicated, append-only event log.
///
/// Local appends and merges are serialized behind one per-log write lock.
/// Reads (`list`, `heads`, ...) take a short read lock on the state and
/// never wait for the network or the store.
pub struct Log {
    id: String,
    keypair: Keypair,
    identity: Identity,
    pub(crate) access: Arc<dyn AccessController>,
    pub(crate) shared_key: Option<SharedKey>,
    pub(crate) store: Arc<dyn ContentStore>,
    cache: Arc<dyn HeadStore>,
    pub(crate) state: RwLock<LogState>,
    pub(crate) write_lock: tokio::sync::Mutex<()>,
}

impl Log {
    /// Create an empty log without consulting the head cache.
    pub fn new(id: impl Into<String>, ctx: LogContext) -> Self {
        let identity = ctx.keypair.identity();
        let state = LogState::new(&identity.id);
        Self {
            id: id.into(),
            keypair: ctx.keypair,
            identity,
            access: ctx.access,
            shared_key: ctx.shared_key,
            store: ctx.store,
            cache: ctx.cache,
            state: RwLock::new(state),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a log, rebuilding it from the cached heads.
    ///
    /// Every entry reachable from the cached heads is read back from the
    /// content store and verified again. Entries missing from the store are
    /// skipped with a warning.
    pub async fn open(id: impl Into<String>, ctx: LogContext) -> Result<Self> {
        let log = Self::new(id, ctx);
        let heads = log.cache.load(&log.id)?;
        if heads.is_empty() {
            return Ok(log);
        }

        let fetcher = StoreFetcher::new(log.store.clone());
        let report = log.merge(&heads, &fetcher).await?;
        if !report.missing.is_empty() || !report.rejected.is_empty() {
            warn!(
                log = %log.id,
                missing = report.missing.len(),
                rejected = report.rejected.len(),
                "log reopened with gaps"
            );
        }
        info!(log = %log.id, entries = log.len(), "log reopened");
        Ok(log)
    }

    /// Append a value.
    ///
    /// Fails with [`LogError::AccessDenied`] when the local identity lacks
    /// the `write` capability. Returns once the entry is durable in the
    /// content store and the new heads in the head cache. If either write
    /// fails the log is unchanged.
    pub async fn add(&self, value: impl Into<Vec<u8>>) -> Result<Record> {
        let _guard = self.write_lock.lock().await;

        self.access.check(&self.identity, OperationKind::Append)?;

        let operation = Operation::add(value);
        let plaintext = operation.encode()?;
        let payload = match &self.shared_key {
            Some(key) => key.encrypt(&plaintext)?,
            None => plaintext,
        };

        let (predecessors, clock) = {
            let state = self.read_state();
            (
                state.heads.iter().copied().collect::<Vec<_>>(),
                state.clock.tick(),
            )
        };

        let entry = Entry::new_signed(&self.keypair, payload, clock, predecessors)?;

        let stored = self.store.put(Bytes::from(entry.to_bytes()?)).await?;
        if stored != entry.hash {
            return Err(LogError::InvalidHash);
        }

        // Heads are durable before the entry becomes visible.
        let record = Record { entry, operation };
        let heads = self.read_state().heads_after([&record]);
        self.cache.store(&self.id, &heads)?;
        self.write_state().insert(record.clone());

        debug!(
            log = %self.id,
            hash = %record.hash(),
            time = record.entry.clock.time,
            "appended entry"
        );

        Ok(record)
    }

    /// Deterministic total order of the log.
    ///
    /// A topological sort of the DAG (predecessors first) with ties broken
    /// by clock time, then by hash. Two logs holding the same entries always
    /// list them identically.
    pub fn list(&self, options: ListOptions) -> Vec<Record> {
        let snapshot: Vec<Record> = self.read_state().entries.values().cloned().collect();
        let mut ordered = topological_order(snapshot);

        let keep = match options.amount {
            Amount::All => ordered.len(),
            Amount::Limit(n) => n.min(ordered.len()),
        };
        ordered.drain(..ordered.len() - keep);

        if options.direction == Direction::Backward {
            ordered.reverse();
        }
        ordered
    }

    /// Canonical bytes of the requested entries and their ancestors, for a
    /// peer whose heads are `have`.
    ///
    /// Walks back from `hashes`, stopping at `have`, and returns at most
    /// `limit` entries in topological order (parents before children).
    /// Local-only: unknown hashes are skipped.
    pub fn collect_for_peer(
        &self,
        hashes: &[ContentHash],
        have: &[ContentHash],
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let stop: HashSet<ContentHash> = have.iter().copied().collect();

        // Phase 1: BFS backward from the requested hashes.
        let mut found: HashMap<ContentHash, Entry> = HashMap::new();
        {
            let state = self.read_state();
            let mut queue: VecDeque<ContentHash> = hashes.iter().copied().collect();

            while let Some(hash) = queue.pop_front() {
                if found.len() >= limit {
                    break;
                }
                if found.contains_key(&hash) || stop.contains(&hash) {
                    continue;
                }
                if let Some(record) = state.entries.get(&hash) {
                    for pred in &record.entry.predecessors {
                        if !stop.contains(pred) && !found.contains_key(pred) {
                            queue.push_back(*pred);
                        }
                    }
                    found.insert(hash, record.entry.clone());
                }
            }
        }

        // Phase 2: Kahn's topological sort over the collected set.
        let mut in_degree: HashMap<ContentHash, usize> = HashMap::new();
        let mut children: HashMap<ContentHash, Vec<ContentHash>> = HashMap::new();

        for (hash, entry) in &found {
            let deg = entry
                .predecessors
                .iter()
                .filter(|p| found.contains_key(*p))
                .count();
            in_degree.insert(*hash, deg);

            for pred in &entry.predecessors {
                if found.contains_key(pred) {
                    children.entry(*pred).or_default().push(*hash);
                }
            }
        }

        let mut ready: Vec<ContentHash> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(h, _)| *h)
            .collect();
        ready.sort();
        let mut ready: VecDeque<ContentHash> = ready.into();

        let mut result = Vec::with_capacity(found.len());
        while let Some(hash) = ready.pop_front() {
            if let Some(entry) = found.get(&hash) {
                result.push(entry.to_bytes()?);
            }
            if let Some(kids) = children.get(&hash) {
                for kid in kids {
                    if let Some(deg) = in_degree.get_mut(kid) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(*kid);
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    /// Log id (its address when opened through a node).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local writer identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether payloads are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.shared_key.is_some()
    }

    /// Current heads, sorted.
    pub fn heads(&self) -> Vec<ContentHash> {
        self.read_state().heads.iter().copied().collect()
    }

    /// Number of accepted entries.
    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `hash` is an accepted entry.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.read_state().knows(hash)
    }

    /// Accepted entry by hash.
    pub fn get(&self, hash: &ContentHash) -> Option<Record> {
        self.read_state().entries.get(hash).cloned()
    }

    /// Whether `hash` was rejected (or descends from a rejected entry).
    pub fn is_rejected(&self, hash: &ContentHash) -> bool {
        self.read_state().rejected.contains(hash)
    }

    /// Highest clock time seen.
    pub fn clock_time(&self) -> u64 {
        self.read_state().clock.time
    }

    pub(crate) fn persist_heads(&self, heads: &[ContentHash]) -> Result<()> {
        self.cache.store(&self.id, heads)
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().expect("log state lock poisoned")
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().expect("log state lock poisoned")
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("Log")
            .field("id", &self.id)
            .field("entries", &state.entries.len())
            .field("heads", &state.heads.len())
            .field("encrypted", &self.shared_key.is_some())
            .finish()
    }
}

/// Kahn's algorithm over `records`, always releasing the ready entry with
/// the smallest `(clock.time, hash)`.
///
/// Predecessors outside `records` count as already satisfied.
pub(crate) fn topological_order(records: Vec<Record>) -> Vec<Record> {
    let mut by_hash: HashMap<ContentHash, Record> =
        records.into_iter().map(|r| (r.hash(), r)).collect();

    let mut in_degree: HashMap<ContentHash, usize> = HashMap::new();
    let mut children: HashMap<ContentHash, Vec<ContentHash>> = HashMap::new();

    for (hash, record) in &by_hash {
        let deg = record
            .entry
            .predecessors
            .iter()
            .filter(|p| by_hash.contains_key(*p))
            .count();
        in_degree.insert(*hash, deg);

        for pred in &record.entry.predecessors {
            if by_hash.contains_key(pred) {
                children.entry(*pred).or_default().push(*hash);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u64, ContentHash)>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(h, _)| Reverse((by_hash[h].entry.clock.time, *h)))
        .collect();

    let mut result = Vec::with_capacity(by_hash.len());
    while let Some(Reverse((_, hash))) = ready.pop() {
        if let Some(kids) = children.get(&hash) {
            for kid in kids {
                if let Some(deg) = in_degree.get_mut(kid) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((by_hash[kid].entry.clock.time, *kid)));
                    }
                }
            }
        }
        if let Some(record) = by_hash.remove(&hash) {
            result.push(record);
        }
    }

    result
}
