//! Causal merge of remote entries.
//!
//! Merging runs in two phases so callers can observe them separately:
//!
//! 1. [`Log::resolve`] pulls every entry reachable from the remote heads
//!    that the log does not know yet, round by round, and verifies each one
//!    (signature, write access, decryption). No log state changes.
//! 2. [`Log::apply`] takes the write lock and installs the verified entries
//!    in causal order. An entry is only linked in when its whole ancestry is
//!    present and valid: descendants of a rejected entry are rejected too,
//!    and entries with ancestors that could not be fetched are withheld.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use bytes::Bytes;
use tide_access::OperationKind;
use tide_crypto::CryptoError;
use tide_types::ContentHash;
use tracing::{debug, warn};

use crate::entry::{Entry, Operation, Record};
use crate::error::{LogError, Result};
use crate::fetch::EntryFetcher;
use crate::oplog::Log;

/// Why a remote entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The signature does not verify for the claimed writer.
    InvalidSignature,
    /// The writer lacks the `write` capability.
    AccessDenied,
    /// The payload does not decrypt under the log's key.
    Decryption,
    /// The payload is not a valid operation.
    Malformed,
    /// An ancestor of the entry was rejected.
    RejectedAncestor,
}

/// Outcome of verifying one fetched entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid(Operation),
    Rejected(Rejection),
}

/// A fetched entry and its verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEntry {
    pub entry: Entry,
    pub verdict: Verdict,
}

impl FetchedEntry {
    pub fn hash(&self) -> ContentHash {
        self.entry.hash
    }

    /// The entry as a record, when it verified.
    pub fn record(&self) -> Option<Record> {
        match &self.verdict {
            Verdict::Valid(operation) => Some(Record {
                entry: self.entry.clone(),
                operation: operation.clone(),
            }),
            Verdict::Rejected(_) => None,
        }
    }
}

/// Result of [`Log::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedBatch {
    /// Every entry fetched, in fetch order.
    pub fetched: Vec<FetchedEntry>,
    /// Needed hashes no source could provide.
    pub missing: Vec<ContentHash>,
}

impl ResolvedBatch {
    pub fn is_empty(&self) -> bool {
        self.fetched.is_empty()
    }
}

/// Result of [`Log::apply`] / [`Log::merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Newly added entries, in causal order.
    pub added: Vec<Record>,
    /// Entries refused in this pass.
    pub rejected: Vec<(ContentHash, Rejection)>,
    /// Valid entries kept out because an ancestor is still missing.
    pub withheld: Vec<FetchedEntry>,
    /// Needed hashes no source could provide.
    pub missing: Vec<ContentHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Known,
    Accept,
    Reject,
    Withhold,
}

impl Log {
    /// Fetch, verify, and install everything reachable from `heads`.
    ///
    /// Idempotent: hashes the log already holds are never fetched again.
    pub async fn merge(
        &self,
        heads: &[ContentHash],
        fetcher: &dyn EntryFetcher,
    ) -> Result<MergeReport> {
        let batch = self.resolve(heads, fetcher).await?;
        self.apply(batch).await
    }

    /// Fetch and verify every unknown entry reachable from `heads`.
    ///
    /// Fetch rounds continue until the causal prefix is complete or a round
    /// makes no progress; hashes still needed then are reported as
    /// `missing`. A [`LogError::Cancelled`] from the fetcher aborts the whole
    /// resolve and discards everything fetched so far. Any other fetch error
    /// ends the rounds early.
    pub async fn resolve(
        &self,
        heads: &[ContentHash],
        fetcher: &dyn EntryFetcher,
    ) -> Result<ResolvedBatch> {
        let mut wanted: BTreeSet<ContentHash> = heads
            .iter()
            .copied()
            .filter(|h| !self.is_settled(h))
            .collect();

        let mut fetched: HashMap<ContentHash, usize> = HashMap::new();
        let mut batch = ResolvedBatch::default();
        let have = self.heads();

        while !wanted.is_empty() {
            let request: Vec<ContentHash> = wanted.iter().copied().collect();
            let blobs = match fetcher.fetch(&request, &have).await {
                Ok(blobs) => blobs,
                Err(LogError::Cancelled) => return Err(LogError::Cancelled),
                Err(e) => {
                    warn!(log = %self.id(), wanted = request.len(), %e, "entry fetch failed");
                    break;
                }
            };

            let mut candidates: HashMap<ContentHash, Entry> = HashMap::new();
            for blob in blobs {
                match Entry::from_bytes(&blob) {
                    Ok(entry) => {
                        candidates.insert(entry.hash, entry);
                    }
                    Err(e) => debug!(%e, "discarding undecodable entry"),
                }
            }

            // Only keep candidates reachable from what we asked for.
            let mut next: BTreeSet<ContentHash> = BTreeSet::new();
            let mut stack = request;
            let mut progressed = false;

            while let Some(hash) = stack.pop() {
                if fetched.contains_key(&hash) || self.is_settled(&hash) {
                    continue;
                }
                let Some(entry) = candidates.remove(&hash) else {
                    next.insert(hash);
                    continue;
                };

                progressed = true;
                let verdict = self.verify(&entry);
                if matches!(verdict, Verdict::Valid(_)) {
                    stack.extend(entry.predecessors.iter().copied());
                }

                fetched.insert(hash, batch.fetched.len());
                batch.fetched.push(FetchedEntry { entry, verdict });
            }

            // A predecessor queued before its entry arrived may since have
            // been fetched.
            next.retain(|h| !fetched.contains_key(h));

            wanted = next;
            if !progressed {
                break;
            }
        }

        batch.missing = wanted.into_iter().collect();
        debug!(
            log = %self.id(),
            fetched = batch.fetched.len(),
            missing = batch.missing.len(),
            "resolved remote heads"
        );
        Ok(batch)
    }

    /// Install a resolved batch.
    ///
    /// Entries are processed in topological order (ties broken by clock
    /// time, then hash). Accepted entries are written to the content store
    /// and the resulting heads to the head cache before any of them becomes
    /// visible, then linked in together. A failed write leaves the log
    /// unchanged.
    pub async fn apply(&self, batch: ResolvedBatch) -> Result<MergeReport> {
        let _guard = self.write_lock.lock().await;

        let mut report = MergeReport {
            missing: batch.missing,
            ..MergeReport::default()
        };

        let by_hash: HashMap<ContentHash, &FetchedEntry> =
            batch.fetched.iter().map(|f| (f.hash(), f)).collect();
        let order = batch_order(&batch.fetched);
        let mut status: HashMap<ContentHash, Status> = HashMap::new();

        {
            let state = self.read_state();
            for hash in &order {
                let fetched = by_hash[hash];

                if state.knows(hash) {
                    status.insert(*hash, Status::Known);
                    continue;
                }
                if state.rejected.contains(hash) {
                    status.insert(*hash, Status::Reject);
                    continue;
                }

                let verdict = match &fetched.verdict {
                    Verdict::Rejected(reason) => Some(*reason),
                    Verdict::Valid(_) => None,
                };

                let mut tainted = false;
                let mut blocked = false;
                for pred in &fetched.entry.predecessors {
                    let pred_status = match status.get(pred) {
                        Some(s) => *s,
                        None if state.knows(pred) => Status::Known,
                        None if state.rejected.contains(pred) => Status::Reject,
                        None => Status::Withhold,
                    };
                    match pred_status {
                        Status::Reject => tainted = true,
                        Status::Withhold => blocked = true,
                        Status::Known | Status::Accept => {}
                    }
                }

                let outcome = match (verdict, tainted, blocked) {
                    (Some(reason), _, _) => {
                        report.rejected.push((*hash, reason));
                        Status::Reject
                    }
                    (None, true, _) => {
                        report.rejected.push((*hash, Rejection::RejectedAncestor));
                        Status::Reject
                    }
                    (None, false, true) => {
                        report.withheld.push(fetched.clone());
                        Status::Withhold
                    }
                    (None, false, false) => Status::Accept,
                };
                status.insert(*hash, outcome);
            }
        }

        let accepted: Vec<Record> = order
            .iter()
            .filter(|h| status.get(*h) == Some(&Status::Accept))
            .filter_map(|h| by_hash[h].record())
            .collect();

        for record in &accepted {
            self.store
                .put(Bytes::from(record.entry.to_bytes()?))
                .await?;
        }

        // Heads are durable before any accepted entry becomes visible.
        if !accepted.is_empty() {
            let heads = self.read_state().heads_after(&accepted);
            self.persist_heads(&heads)?;
        }
        {
            let mut state = self.write_state();
            for record in &accepted {
                state.insert(record.clone());
            }
            for (hash, _) in &report.rejected {
                state.rejected.insert(*hash);
            }
        }

        for (hash, reason) in &report.rejected {
            warn!(log = %self.id(), %hash, ?reason, "rejected remote entry");
        }
        debug!(
            log = %self.id(),
            added = accepted.len(),
            rejected = report.rejected.len(),
            withheld = report.withheld.len(),
            "merged remote entries"
        );

        report.added = accepted;
        Ok(report)
    }

    /// Check one remote entry: signature, write access, payload.
    pub fn verify(&self, entry: &Entry) -> Verdict {
        if let Err(e) = entry.verify_signature() {
            debug!(hash = %entry.hash, %e, "entry signature invalid");
            return Verdict::Rejected(Rejection::InvalidSignature);
        }

        if !self
            .access
            .can_append(&entry.identity, OperationKind::Append)
        {
            return Verdict::Rejected(Rejection::AccessDenied);
        }

        let plaintext = match &self.shared_key {
            Some(key) => match key.decrypt(&entry.payload) {
                Ok(plaintext) => plaintext,
                Err(CryptoError::Decryption) => {
                    return Verdict::Rejected(Rejection::Decryption);
                }
                Err(_) => return Verdict::Rejected(Rejection::Malformed),
            },
            None => entry.payload.clone(),
        };

        match Operation::decode(&plaintext) {
            Ok(operation) => Verdict::Valid(operation),
            Err(_) => Verdict::Rejected(Rejection::Malformed),
        }
    }

    /// Known or permanently rejected: nothing left to fetch.
    fn is_settled(&self, hash: &ContentHash) -> bool {
        let state = self.read_state();
        state.knows(hash) || state.rejected.contains(hash)
    }
}

/// Topological order of a batch, smallest `(clock.time, hash)` first among
/// ready entries. Entries caught in a cycle (impossible for honest hashes)
/// are appended last so they end up withheld.
fn batch_order(fetched: &[FetchedEntry]) -> Vec<ContentHash> {
    let by_hash: HashMap<ContentHash, &Entry> =
        fetched.iter().map(|f| (f.hash(), &f.entry)).collect();

    let mut in_degree: HashMap<ContentHash, usize> = HashMap::new();
    let mut children: HashMap<ContentHash, Vec<ContentHash>> = HashMap::new();

    for (hash, entry) in &by_hash {
        let deg = entry
            .predecessors
            .iter()
            .filter(|p| by_hash.contains_key(*p))
            .count();
        in_degree.insert(*hash, deg);

        for pred in &entry.predecessors {
            if by_hash.contains_key(pred) {
                children.entry(*pred).or_default().push(*hash);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u64, ContentHash)>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(h, _)| Reverse((by_hash[h].clock.time, *h)))
        .collect();

    let mut order = Vec::with_capacity(by_hash.len());
    while let Some(Reverse((_, hash))) = ready.pop() {
        order.push(hash);
        if let Some(kids) = children.get(&hash) {
            for kid in kids {
                if let Some(deg) = in_degree.get_mut(kid) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((by_hash[kid].clock.time, *kid)));
                    }
                }
            }
        }
    }

    if order.len() < by_hash.len() {
        let mut rest: Vec<ContentHash> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(h, _)| *h)
            .collect();
        rest.sort();
        order.extend(rest);
    }

    order
}
