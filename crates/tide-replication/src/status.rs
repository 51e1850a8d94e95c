//! Observable replication state and counters.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Phase of the replication state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationStatus {
    #[default]
    Idle,
    /// Broadcasting our heads to peers.
    Announcing,
    /// Pulling missing ancestors from peers.
    FetchingAncestors,
    /// Installing verified entries into the log.
    Merging,
}

impl ReplicationStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Announcing,
            2 => Self::FetchingAncestors,
            3 => Self::Merging,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Announcing => 1,
            Self::FetchingAncestors => 2,
            Self::Merging => 3,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn get(&self) -> ReplicationStatus {
        ReplicationStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: ReplicationStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    /// Move from `from` to `to`; does nothing if the phase is not `from`.
    pub(crate) fn transition(&self, from: ReplicationStatus, to: ReplicationStatus) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Running counters for one replicator.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    batches: AtomicU64,
    fetched: AtomicU64,
    added: AtomicU64,
    rejected: AtomicU64,
    unresolved: AtomicU64,
    failed_merges: AtomicU64,
    transport_errors: AtomicU64,
}

/// Point-in-time copy of [`ReplicationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Head batches that triggered a fetch.
    pub batches: u64,
    /// Remote entries fetched.
    pub fetched: u64,
    /// Remote entries linked into the log.
    pub added: u64,
    /// Remote entries refused.
    pub rejected: u64,
    /// Needed hashes no peer could provide.
    pub unresolved: u64,
    /// Batches discarded because the merge could not be persisted.
    pub failed_merges: u64,
    /// Failed sends and requests.
    pub transport_errors: u64,
}

impl ReplicationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            failed_merges: self.failed_merges.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self, fetched: usize, added: usize, rejected: usize, unresolved: usize) {
        self.fetched.fetch_add(fetched as u64, Ordering::Relaxed);
        self.added.fetch_add(added as u64, Ordering::Relaxed);
        self.rejected.fetch_add(rejected as u64, Ordering::Relaxed);
        self.unresolved.fetch_add(unresolved as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_merge(&self) {
        self.failed_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }
}
