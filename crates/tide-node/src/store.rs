//! [`EventLogStore`]: an open, replicated event log.

use std::sync::Arc;

use tide_log::{ListOptions, Log, Record};
use tide_replication::{
    EventKind, ReplicationError, ReplicationStatus, Replicator, StatsSnapshot, StoreEvent,
};
use tide_types::{ContentHash, PeerId};
use tide_types::events::{EventBus, SubscribeOptions, Subscription};
use tracing::{debug, info};

use crate::error::Result;
use crate::manifest::{LogAddress, LogManifest};

/// An event log opened on a [`Node`](crate::Node).
///
/// Appends are durable locally before [`add`](Self::add) returns; peers
/// learn about them in the background. Every store owns its own event bus.
pub struct EventLogStore {
    address: LogAddress,
    manifest: LogManifest,
    log: Arc<Log>,
    replicator: Replicator,
    bus: EventBus<StoreEvent>,
}

impl EventLogStore {
    pub(crate) fn new(
        address: LogAddress,
        manifest: LogManifest,
        log: Arc<Log>,
        replicator: Replicator,
        bus: EventBus<StoreEvent>,
    ) -> Self {
        Self {
            address,
            manifest,
            log,
            replicator,
            bus,
        }
    }

    /// Append a value.
    ///
    /// Fails with an access error when this node may not write, and with an
    /// encoding error when the value cannot be encoded.
    pub async fn add(&self, value: impl Into<Vec<u8>>) -> Result<Record> {
        if !self.replicator.is_running() {
            return Err(ReplicationError::ShutDown.into());
        }
        let record = self.log.add(value).await?;
        self.replicator.announce()?;
        self.bus
            .emit(StoreEvent::Write {
                record: record.clone(),
            })
            .await;
        debug!(address = %self.address, hash = %record.hash(), "appended");
        Ok(record)
    }

    /// Entries in deterministic order.
    pub fn list(&self, options: ListOptions) -> Vec<Record> {
        self.log.list(options)
    }

    /// Look up one entry.
    pub fn get(&self, hash: &ContentHash) -> Option<Record> {
        self.log.get(hash)
    }

    /// Subscribe to some event kinds.
    pub fn subscribe(
        &self,
        kinds: impl IntoIterator<Item = EventKind>,
        options: SubscribeOptions,
    ) -> Result<Subscription<StoreEvent>> {
        Ok(self.bus.subscribe(kinds, options)?)
    }

    /// This store's event bus.
    pub fn events(&self) -> &EventBus<StoreEvent> {
        &self.bus
    }

    pub fn address(&self) -> &LogAddress {
        &self.address
    }

    pub fn manifest(&self) -> &LogManifest {
        &self.manifest
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn heads(&self) -> Vec<ContentHash> {
        self.log.heads()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Peers currently reachable on this log's channel.
    pub fn peers(&self) -> Vec<PeerId> {
        self.replicator.channel().peers()
    }

    pub fn status(&self) -> ReplicationStatus {
        self.replicator.status()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.replicator.stats()
    }

    /// Stop replicating and close the event bus.
    ///
    /// Entries stay in the content store and head cache; opening the same
    /// address again picks them up.
    pub async fn close(&self) {
        self.replicator.shutdown().await;
        self.bus.close();
        info!(address = %self.address, "log closed");
    }
}

impl std::fmt::Debug for EventLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogStore")
            .field("address", &self.address.to_string())
            .field("entries", &self.log.len())
            .finish()
    }
}
