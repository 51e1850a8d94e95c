//! Replication coordinator for Tide logs.
//!
//! A [`Replicator`] keeps one [`Log`](tide_log::Log) in sync with the peers
//! of one [`Channel`](tide_net::Channel). Heads are announced after local
//! appends and exchanged when peers join; unknown heads are resolved by
//! fetching missing ancestors from peers, verified, and merged. Progress is
//! published as [`StoreEvent`]s on the log's event bus.
//!
//! The coordinator never branches on the channel flavour in use.

mod config;
mod error;
mod events;
mod fetcher;
mod replicator;
mod status;

#[cfg(test)]
mod tests;

pub use config::ReplicationConfig;
pub use error::{ReplicationError, Result};
pub use events::{EventKind, StoreEvent};
pub use replicator::Replicator;
pub use status::{ReplicationStats, ReplicationStatus, StatsSnapshot};
