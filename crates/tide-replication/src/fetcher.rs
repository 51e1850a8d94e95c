//! Fetching remote entries over a channel.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use tide_log::{EntryFetcher, LogError};
use tide_net::{Channel, LogMessage};
use tide_types::{ContentHash, PeerId};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ReplicationConfig;
use crate::status::ReplicationStats;

/// Verified entries withheld by an earlier pass, keyed by hash.
///
/// They are served again before asking the network, so an entry fetched
/// once is not fetched twice.
pub(crate) type Pending = HashMap<ContentHash, Vec<u8>>;

/// Run `fut` unless shutdown is (or becomes) signalled.
pub(crate) async fn until_shutdown<T>(
    shutdown: &watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Option<T> {
    let mut shutdown = shutdown.clone();
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        _ = shutdown.wait_for(|stop| *stop) => None,
    }
}

/// [`EntryFetcher`] backed by the peers of a channel.
///
/// Order of sources: the pending buffer, the peer that announced the heads,
/// then every other peer. A round in which some request failed at the
/// transport level is retried with exponential backoff; a round in which
/// every reachable peer answered but none had the entries is not.
pub(crate) struct PeerFetcher<'a> {
    pub(crate) channel: &'a dyn Channel,
    pub(crate) announcer: PeerId,
    pub(crate) pending: &'a Pending,
    pub(crate) config: &'a ReplicationConfig,
    pub(crate) stats: &'a ReplicationStats,
    pub(crate) shutdown: &'a watch::Receiver<bool>,
}

impl PeerFetcher<'_> {
    fn candidates(&self) -> Vec<PeerId> {
        let local = self.channel.local_id();
        let mut peers = vec![self.announcer];
        peers.extend(
            self.channel
                .peers()
                .into_iter()
                .filter(|p| *p != self.announcer && *p != local),
        );
        peers
    }
}

#[async_trait]
impl EntryFetcher for PeerFetcher<'_> {
    async fn fetch(
        &self,
        hashes: &[ContentHash],
        have: &[ContentHash],
    ) -> tide_log::Result<Vec<Vec<u8>>> {
        let mut blobs = Vec::new();
        let mut remote = Vec::new();
        for hash in hashes {
            match self.pending.get(hash) {
                Some(bytes) => blobs.push(bytes.clone()),
                None => remote.push(*hash),
            }
        }
        if remote.is_empty() {
            return Ok(blobs);
        }

        let request = LogMessage::EntryRequest {
            hashes: remote.clone(),
            have: have.to_vec(),
            limit: self.config.max_entries_per_response,
        };

        for attempt in 0..self.config.max_fetch_attempts {
            let mut transport_failed = false;

            for peer in self.candidates() {
                let exchange =
                    self.channel
                        .request(peer, &request, self.config.request_timeout());
                let Some(result) = until_shutdown(self.shutdown, exchange).await else {
                    return Err(LogError::Cancelled);
                };

                match result {
                    Ok(LogMessage::EntryResponse { entries }) if !entries.is_empty() => {
                        debug!(
                            peer = %peer.fmt_short(),
                            entries = entries.len(),
                            "fetched entries"
                        );
                        blobs.extend(entries);
                        return Ok(blobs);
                    }
                    Ok(LogMessage::EntryResponse { .. }) => {
                        debug!(peer = %peer.fmt_short(), "peer has none of the requested entries");
                    }
                    Ok(other) => {
                        warn!(peer = %peer.fmt_short(), kind = other.kind(), "unexpected response to entry request");
                    }
                    Err(e) => {
                        debug!(peer = %peer.fmt_short(), %e, attempt, "entry request failed");
                        self.stats.record_transport_error();
                        transport_failed = true;
                    }
                }
            }

            if !transport_failed || attempt + 1 >= self.config.max_fetch_attempts {
                break;
            }
            let delay = self.config.backoff(attempt);
            if until_shutdown(self.shutdown, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return Err(LogError::Cancelled);
            }
        }

        if blobs.is_empty() {
            return Err(LogError::Fetch(format!(
                "no peer provided any of {} entries",
                remote.len()
            )));
        }
        Ok(blobs)
    }
}
