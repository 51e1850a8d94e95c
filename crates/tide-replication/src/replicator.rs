//! The replication coordinator.
//!
//! A [`Replicator`] drives one log over one channel with three background
//! tasks:
//!
//! - the **dispatcher** reads the channel's inbound stream, answers entry
//!   and manifest requests, queues head announcements and greets joining
//!   peers with our heads;
//! - the **worker** takes queued announcements one at a time and runs the
//!   fetch/verify/merge cycle, publishing [`StoreEvent`]s;
//! - the **announcer** broadcasts our latest heads whenever they change,
//!   reporting [`ReplicationStatus::Announcing`] while the worker is idle.
//!
//! All three stop on [`Replicator::shutdown`]. An in-flight fetch is
//! abandoned and nothing it fetched is merged.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tide_log::{FetchedEntry, Log, LogError, Record, ResolvedBatch};
use tide_net::{Channel, Delivery, Destination, LogMessage, MAX_MESSAGE_SIZE, Responder};
use tide_types::events::EventBus;
use tide_types::{ContentHash, PeerId};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::events::StoreEvent;
use crate::fetcher::{PeerFetcher, Pending, until_shutdown};
use crate::status::{ReplicationStats, ReplicationStatus, StatsSnapshot, StatusCell};

/// Room left in a response for framing around the entries.
const RESPONSE_OVERHEAD: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Announcement queue
// ---------------------------------------------------------------------------

/// Heads a peer told us about.
#[derive(Debug, Clone)]
struct Announcement {
    peer: PeerId,
    heads: Vec<ContentHash>,
}

/// FIFO of announcements, coalesced per peer.
///
/// A peer's heads cover everything it announced before, so a second
/// announcement from a peer already queued is folded into the first.
struct AnnouncementQueue {
    queued: Mutex<VecDeque<Announcement>>,
    notify: Notify,
    capacity: usize,
}

impl AnnouncementQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, announcement: Announcement) {
        {
            let mut queued = self.queued.lock().expect("queue lock poisoned");
            if let Some(existing) = queued.iter_mut().find(|a| a.peer == announcement.peer) {
                existing.heads.extend(announcement.heads);
                existing.heads.sort();
                existing.heads.dedup();
            } else {
                if queued.len() >= self.capacity
                    && let Some(dropped) = queued.pop_front()
                {
                    warn!(peer = %dropped.peer.fmt_short(), "announcement queue full, dropping oldest");
                }
                queued.push_back(announcement);
            }
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Announcement {
        loop {
            let next = self.queued.lock().expect("queue lock poisoned").pop_front();
            if let Some(next) = next {
                return next;
            }
            self.notify.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    log: Arc<Log>,
    channel: Arc<dyn Channel>,
    bus: EventBus<StoreEvent>,
    config: ReplicationConfig,
    manifest: Option<(ContentHash, Vec<u8>)>,
    queue: AnnouncementQueue,
    status: StatusCell,
    stats: ReplicationStats,
    heads_tx: watch::Sender<Vec<ContentHash>>,
    shutdown: watch::Receiver<bool>,
}

/// Handle to a running coordinator for one log.
pub struct Replicator {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    /// Start replicating `log` over `channel`.
    ///
    /// `manifest` is the encoded manifest of the log, served to peers that
    /// resolve the log's address.
    pub fn start(
        log: Arc<Log>,
        channel: Arc<dyn Channel>,
        bus: EventBus<StoreEvent>,
        config: ReplicationConfig,
        manifest: Option<Vec<u8>>,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (heads_tx, heads_rx) = watch::channel(log.heads());

        let shared = Arc::new(Shared {
            queue: AnnouncementQueue::new(config.queue_capacity),
            manifest: manifest.map(|bytes| (ContentHash::from_data(&bytes), bytes)),
            log,
            channel,
            bus,
            config,
            status: StatusCell::default(),
            stats: ReplicationStats::default(),
            heads_tx,
            shutdown,
        });

        info!(
            log = %shared.log.id(),
            peer = %shared.channel.local_id().fmt_short(),
            "replicator started"
        );

        let tasks = vec![
            tokio::spawn(shared.clone().run_dispatcher()),
            tokio::spawn(shared.clone().run_worker()),
            tokio::spawn(shared.clone().run_announcer(heads_rx)),
        ];

        Self {
            shared,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Announce the log's current heads to every peer.
    ///
    /// Returns immediately; the broadcast happens in the background.
    pub fn announce(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(ReplicationError::ShutDown);
        }
        self.shared.heads_tx.send_replace(self.shared.log.heads());
        Ok(())
    }

    /// Queue heads as if `peer` had announced them.
    pub fn enqueue(&self, peer: PeerId, heads: Vec<ContentHash>) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(ReplicationError::ShutDown);
        }
        self.shared.queue.push(Announcement { peer, heads });
        Ok(())
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.shared.log
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.shared.channel
    }

    pub fn bus(&self) -> &EventBus<StoreEvent> {
        &self.shared.bus
    }

    pub fn status(&self) -> ReplicationStatus {
        self.shared.status.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Stop all background tasks and leave the channel.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(log = %self.shared.log.id(), "replicator shutting down");
        self.shared.channel.close().await;

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(%e, "replication task failed");
            }
        }
        self.shared.status.set(ReplicationStatus::Idle);
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("log", &self.shared.log.id())
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

impl Shared {
    async fn run_dispatcher(self: Arc<Self>) {
        let mut inbound = self.channel.inbound();

        loop {
            let Some(delivery) = until_shutdown(&self.shutdown, inbound.recv()).await else {
                break;
            };
            let Some(delivery) = delivery else {
                debug!(log = %self.log.id(), "inbound stream ended");
                break;
            };

            match delivery {
                Delivery::Message {
                    from,
                    message: LogMessage::Heads { heads },
                } => {
                    debug!(peer = %from.fmt_short(), heads = heads.len(), "heads announced");
                    self.queue.push(Announcement { peer: from, heads });
                }
                Delivery::Message { from, message } => {
                    debug!(peer = %from.fmt_short(), kind = message.kind(), "ignoring message");
                }
                Delivery::Request {
                    from,
                    message,
                    responder,
                } => self.answer(from, message, responder),
                Delivery::PeerJoined(peer) => self.greet(peer).await,
                Delivery::PeerLeft(peer) => {
                    debug!(peer = %peer.fmt_short(), "peer left");
                }
            }
        }
    }

    fn answer(&self, from: PeerId, message: LogMessage, responder: Responder) {
        let reply = match message {
            LogMessage::EntryRequest {
                hashes,
                have,
                limit,
            } => {
                let limit = limit.min(self.config.max_entries_per_response) as usize;
                match self.log.collect_for_peer(&hashes, &have, limit) {
                    Ok(entries) => LogMessage::EntryResponse {
                        entries: fit_response(entries),
                    },
                    Err(e) => {
                        warn!(peer = %from.fmt_short(), %e, "cannot serve entries");
                        LogMessage::EntryResponse {
                            entries: Vec::new(),
                        }
                    }
                }
            }
            LogMessage::ManifestRequest { manifest } => LogMessage::ManifestResponse {
                manifest: self
                    .manifest
                    .as_ref()
                    .filter(|(hash, _)| *hash == manifest)
                    .map(|(_, bytes)| bytes.clone()),
            },
            other => {
                debug!(peer = %from.fmt_short(), kind = other.kind(), "unexpected request");
                return;
            }
        };

        if let Err(e) = responder.respond(&reply) {
            debug!(peer = %from.fmt_short(), %e, "response not delivered");
            self.stats.record_transport_error();
        }
    }

    /// Head exchange with a peer that just became reachable.
    async fn greet(&self, peer: PeerId) {
        let heads = self.log.heads();
        if heads.is_empty() {
            return;
        }
        debug!(peer = %peer.fmt_short(), heads = heads.len(), "sending heads to new peer");
        if let Err(e) = self
            .channel
            .send(Destination::Peer(peer), &LogMessage::Heads { heads })
            .await
        {
            debug!(peer = %peer.fmt_short(), %e, "head exchange failed");
            self.stats.record_transport_error();
        }
    }

    // -----------------------------------------------------------------------
    // Announcer
    // -----------------------------------------------------------------------

    async fn run_announcer(self: Arc<Self>, mut heads_rx: watch::Receiver<Vec<ContentHash>>) {
        loop {
            match until_shutdown(&self.shutdown, heads_rx.changed()).await {
                Some(Ok(())) => {}
                Some(Err(_)) | None => break,
            }
            let heads = heads_rx.borrow_and_update().clone();
            if heads.is_empty() {
                continue;
            }
            let announcing = self
                .status
                .transition(ReplicationStatus::Idle, ReplicationStatus::Announcing);
            let sent = until_shutdown(
                &self.shutdown,
                self.channel
                    .send(Destination::All, &LogMessage::Heads { heads }),
            )
            .await;
            if announcing {
                self.status
                    .transition(ReplicationStatus::Announcing, ReplicationStatus::Idle);
            }
            match sent {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    debug!(log = %self.log.id(), %e, "head announcement incomplete");
                    self.stats.record_transport_error();
                }
                None => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn run_worker(self: Arc<Self>) {
        let mut pending = Pending::new();

        loop {
            let Some(announcement) = until_shutdown(&self.shutdown, self.queue.pop()).await else {
                break;
            };
            if let Err(LogError::Cancelled) = self.process(announcement, &mut pending).await {
                break;
            }
            for phase in [ReplicationStatus::FetchingAncestors, ReplicationStatus::Merging] {
                self.status.transition(phase, ReplicationStatus::Idle);
            }
        }
        debug!(log = %self.log.id(), "replication worker stopped");
    }

    /// One fetch/verify/merge cycle for one announcement.
    async fn process(
        &self,
        announcement: Announcement,
        pending: &mut Pending,
    ) -> std::result::Result<(), LogError> {
        let Announcement { peer, heads } = announcement;
        let unknown: Vec<ContentHash> = heads
            .into_iter()
            .filter(|h| !self.log.contains(h) && !self.log.is_rejected(h))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }

        self.status.set(ReplicationStatus::FetchingAncestors);
        self.stats.record_batch();
        self.publish(StoreEvent::Replicate {
            peer,
            heads: unknown.clone(),
        })
        .await?;

        let already_reported: HashSet<ContentHash> = pending.keys().copied().collect();
        let batch = {
            let fetcher = PeerFetcher {
                channel: self.channel.as_ref(),
                announcer: peer,
                pending: &*pending,
                config: &self.config,
                stats: &self.stats,
                shutdown: &self.shutdown,
            };
            match self.log.resolve(&unknown, &fetcher).await {
                Ok(batch) => batch,
                Err(LogError::Cancelled) => {
                    debug!(log = %self.log.id(), "fetch cancelled, discarding batch");
                    return Err(LogError::Cancelled);
                }
                Err(e) => {
                    warn!(log = %self.log.id(), peer = %peer.fmt_short(), %e, "resolve failed");
                    ResolvedBatch::default()
                }
            }
        };

        // Fetched entries not seen in an earlier pass, with their records.
        let fresh: Vec<(ContentHash, Option<Record>)> = batch
            .fetched
            .iter()
            .filter(|f| !already_reported.contains(&f.hash()))
            .map(|f| (f.hash(), f.record()))
            .collect();

        self.status.set(ReplicationStatus::Merging);
        let fetched_total = batch.fetched.len();
        // A failed merge changes nothing, so nothing is reported; the entries
        // are fetched again on the next announcement.
        let report = match self.log.apply(batch).await {
            Ok(report) => report,
            Err(e) => {
                warn!(log = %self.log.id(), peer = %peer.fmt_short(), %e, "merge failed, batch discarded");
                self.stats.record_failed_merge();
                return Ok(());
            }
        };

        pending.retain(|hash, _| !self.log.contains(hash) && !self.log.is_rejected(hash));
        let dropped = stash_withheld(pending, &report.withheld, self.config.max_pending_entries);
        if dropped > 0 {
            warn!(
                log = %self.log.id(),
                dropped,
                limit = self.config.max_pending_entries,
                "pending buffer full, withheld entries dropped"
            );
        }

        let added: HashSet<ContentHash> = report.added.iter().map(|r| r.hash()).collect();
        for (hash, record) in fresh.iter().cloned() {
            let record = record.filter(|_| added.contains(&hash));
            self.publish(StoreEvent::ReplicateProgress { peer, hash, record })
                .await?;
        }
        self.publish(StoreEvent::Replicated {
            peer,
            log_length: report.added.len(),
        })
        .await?;

        self.stats.record_merge(
            fresh.len(),
            report.added.len(),
            report.rejected.len(),
            report.missing.len(),
        );
        debug!(
            log = %self.log.id(),
            peer = %peer.fmt_short(),
            fetched = fetched_total,
            added = report.added.len(),
            rejected = report.rejected.len(),
            pending = pending.len(),
            "replication batch done"
        );

        // Pass new heads on so peers we are connected to but the writer is
        // not still converge.
        if !report.added.is_empty() {
            self.heads_tx.send_replace(self.log.heads());
        }
        Ok(())
    }

    /// Emit `event`, giving up when shutdown starts while a subscriber
    /// with a full buffer holds the emit back.
    async fn publish(&self, event: StoreEvent) -> std::result::Result<(), LogError> {
        until_shutdown(&self.shutdown, self.bus.emit(event))
            .await
            .ok_or(LogError::Cancelled)
    }
}

/// Keep withheld entries for later passes, up to `limit` in total.
/// Returns how many did not fit.
pub(crate) fn stash_withheld(pending: &mut Pending, withheld: &[FetchedEntry], limit: usize) -> usize {
    let mut dropped = 0;
    for entry in withheld {
        if pending.contains_key(&entry.hash()) {
            continue;
        }
        if pending.len() >= limit {
            dropped += 1;
            continue;
        }
        if let Ok(bytes) = entry.entry.to_bytes() {
            pending.insert(entry.hash(), bytes);
        }
    }
    dropped
}

/// Drop the oldest entries until the response fits in one message.
///
/// `entries` is parents-first, so the entries closest to the requested
/// heads are kept.
fn fit_response(mut entries: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let budget = MAX_MESSAGE_SIZE - RESPONSE_OVERHEAD;
    let mut total: usize = entries.iter().map(|e| e.len() + 8).sum();
    let mut skip = 0;
    while total > budget && skip < entries.len() {
        total -= entries[skip].len() + 8;
        skip += 1;
    }
    if skip > 0 {
        entries.drain(..skip);
    }
    entries
}
