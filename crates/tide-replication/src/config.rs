//! Replication tuning knobs.

use std::time::Duration;

use serde::Deserialize;

/// Tuning for one [`Replicator`](crate::Replicator).
///
/// Deserializes from the `[replication]` section of a node config; missing
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Timeout of a single entry request.
    pub request_timeout_ms: u64,
    /// Fetch rounds attempted before giving up on a set of hashes.
    pub max_fetch_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    pub backoff_max_ms: u64,
    /// Most entries served in one response.
    pub max_entries_per_response: u32,
    /// Most distinct peers with a queued head announcement.
    pub queue_capacity: usize,
    /// Most withheld entries kept while their ancestors are missing.
    pub max_pending_entries: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2000,
            max_fetch_attempts: 4,
            backoff_base_ms: 50,
            backoff_max_ms: 2000,
            max_entries_per_response: 256,
            queue_capacity: 1024,
            max_pending_entries: 4096,
        }
    }
}

impl ReplicationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): `base · 2^attempt`,
    /// capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}
