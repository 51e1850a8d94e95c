//! [`Node`]: one peer, able to open replicated logs by name or address.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tide_access::{AccessControlList, StaticList};
use tide_crypto::{Identity, Keypair, SharedKey};
use tide_log::{HeadCache, HeadStore, Log, LogContext};
use tide_net::{Channel, ChannelFactory, IrohNetwork, LogMessage, RelayMode};
use tide_replication::Replicator;
use tide_store::{ContentStore, FileStore, MemoryStore};
use tide_types::events::EventBus;
use tide_types::{ContentHash, PeerId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::manifest::{EVENTLOG, LogAddress, LogManifest};
use crate::store::EventLogStore;

/// Pause between manifest lookup rounds while no peer has answered.
const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Options for opening a log.
///
/// `access` only applies when creating a log from a name; an address
/// always carries its own access list.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub access: Option<AccessControlList>,
    pub shared_key: Option<SharedKey>,
}

impl LogOptions {
    pub fn with_access(mut self, access: AccessControlList) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_shared_key(mut self, key: SharedKey) -> Self {
        self.shared_key = Some(key);
        self
    }
}

/// A peer.
///
/// Owns the identity, the local content store and head cache, and the
/// channel factory every opened log replicates over.
pub struct Node {
    config: NodeConfig,
    keypair: Keypair,
    store: Arc<dyn ContentStore>,
    cache: Arc<dyn HeadStore>,
    channels: Arc<dyn ChannelFactory>,
}

impl Node {
    /// Create a node from already-built components.
    pub fn new(
        config: NodeConfig,
        keypair: Keypair,
        store: Arc<dyn ContentStore>,
        cache: Arc<dyn HeadStore>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        info!(peer = %keypair.peer_id().fmt_short(), "node created");
        Self {
            config,
            keypair,
            store,
            cache,
            channels,
        }
    }

    /// Create a node whose storage follows `config.node.data_dir`: a file
    /// store and Fjall head cache under it, or memory when unset.
    pub fn open(
        config: NodeConfig,
        keypair: Keypair,
        channels: Arc<dyn ChannelFactory>,
    ) -> Result<Self> {
        let store: Arc<dyn ContentStore> = match &config.node.data_dir {
            Some(dir) => Arc::new(FileStore::new(dir.join("blobs"))?),
            None => Arc::new(MemoryStore::new()),
        };
        let cache: Arc<dyn HeadStore> = match &config.node.data_dir {
            Some(dir) => Arc::new(HeadCache::open(dir.join("heads"))?),
            None => Arc::new(HeadCache::in_memory()),
        };
        Ok(Self::new(config, keypair, store, cache, channels))
    }

    /// Create a node on a fresh iroh endpoint named by `keypair`.
    ///
    /// Channels follow `config.network`. The returned network handle can
    /// learn further peers and must be shut down by the caller.
    pub async fn bind(config: NodeConfig, keypair: Keypair) -> Result<(Self, IrohNetwork)> {
        let relay = if config.network.relay {
            RelayMode::Default
        } else {
            RelayMode::Disabled
        };
        let bootstrap = config.network.bootstrap_peers()?;
        let network = IrohNetwork::bind(keypair.to_seed(), relay).await?;
        for peer in bootstrap {
            network.add_peer_id(peer).await?;
        }
        let factory = network.factory(config.network.channel);
        let node = Self::open(config, keypair, Arc::new(factory))?;
        Ok((node, network))
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Open an event log.
    ///
    /// `name_or_address` is either a plain name, which creates a new log
    /// described by `options`, or a `/tide/<hash>/<name>` address, which
    /// opens the log its creator described. Fails with
    /// [`NodeError::AddressResolution`] when the address is malformed, its
    /// manifest cannot be found, or the key in `options` does not match the
    /// manifest's encryption setting.
    pub async fn log(&self, name_or_address: &str, options: LogOptions) -> Result<EventLogStore> {
        let (address, manifest, manifest_bytes, channel) = if LogAddress::is_address(name_or_address)
        {
            let address = LogAddress::parse(name_or_address)?;
            let channel = self.channels.open(address.topic()).await?;
            match self.resolve(&address, channel.as_ref()).await {
                Ok((manifest, bytes)) => (address, manifest, bytes, channel),
                Err(e) => {
                    channel.close().await;
                    return Err(e);
                }
            }
        } else {
            let (address, manifest, bytes) = self.create(name_or_address, &options).await?;
            let channel = self.channels.open(address.topic()).await?;
            (address, manifest, bytes, channel)
        };

        if manifest.encrypted != options.shared_key.is_some() {
            channel.close().await;
            let reason = if manifest.encrypted {
                "log is encrypted but no shared key was given"
            } else {
                "log is not encrypted but a shared key was given"
            };
            return Err(NodeError::AddressResolution(format!("{address}: {reason}")));
        }

        let ctx = LogContext {
            keypair: self.keypair.clone(),
            access: Arc::new(StaticList::new(manifest.access.clone())),
            shared_key: options.shared_key,
            store: self.store.clone(),
            cache: self.cache.clone(),
        };
        let log = match Log::open(address.to_string(), ctx).await {
            Ok(log) => Arc::new(log),
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        let bus = EventBus::new();
        let replicator = Replicator::start(
            log.clone(),
            channel,
            bus.clone(),
            self.config.replication.clone(),
            Some(manifest_bytes),
        );
        if !log.is_empty() {
            replicator.announce()?;
        }

        info!(%address, entries = log.len(), "log opened");
        Ok(EventLogStore::new(address, manifest, log, replicator, bus))
    }

    /// Build, store and address a new manifest.
    async fn create(
        &self,
        name: &str,
        options: &LogOptions,
    ) -> Result<(LogAddress, LogManifest, Vec<u8>)> {
        if name.is_empty() {
            return Err(NodeError::AddressResolution("empty log name".to_string()));
        }
        let access = options
            .access
            .clone()
            .unwrap_or_else(|| AccessControlList::writers([self.identity().id]));
        let manifest = LogManifest::eventlog(name, access, options.shared_key.is_some());
        let bytes = manifest.encode()?;
        let hash = self.store.put(Bytes::from(bytes.clone())).await?;
        Ok((LogAddress::new(hash, name), manifest, bytes))
    }

    /// Find the manifest an address names: locally first, then from peers
    /// on the log's topic until the resolution timeout.
    async fn resolve(
        &self,
        address: &LogAddress,
        channel: &dyn Channel,
    ) -> Result<(LogManifest, Vec<u8>)> {
        let bytes = match self.store.get(address.manifest).await? {
            Some(bytes) => bytes.to_vec(),
            None => {
                let bytes = self.fetch_manifest(address, channel).await?;
                self.store.put(Bytes::from(bytes.clone())).await?;
                bytes
            }
        };

        let manifest = LogManifest::decode(&bytes).map_err(|e| {
            NodeError::AddressResolution(format!("{address}: unreadable manifest: {e}"))
        })?;
        if manifest.kind != EVENTLOG {
            return Err(NodeError::AddressResolution(format!(
                "{address}: unsupported log type {:?}",
                manifest.kind
            )));
        }
        if manifest.name != address.name {
            return Err(NodeError::AddressResolution(format!(
                "{address}: manifest is for log {:?}",
                manifest.name
            )));
        }
        Ok((manifest, bytes))
    }

    async fn fetch_manifest(&self, address: &LogAddress, channel: &dyn Channel) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.resolution_timeout();
        let request = LogMessage::ManifestRequest {
            manifest: address.manifest,
        };

        loop {
            for peer in channel.peers() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let timeout = remaining.min(self.config.replication.request_timeout());
                match channel.request(peer, &request, timeout).await {
                    Ok(LogMessage::ManifestResponse {
                        manifest: Some(bytes),
                    }) => {
                        if ContentHash::from_data(&bytes) == address.manifest {
                            debug!(%address, peer = %peer.fmt_short(), "manifest fetched");
                            return Ok(bytes);
                        }
                        warn!(%address, peer = %peer.fmt_short(), "peer sent a manifest with the wrong hash");
                    }
                    Ok(LogMessage::ManifestResponse { manifest: None }) => {
                        debug!(%address, peer = %peer.fmt_short(), "peer does not know the manifest");
                    }
                    Ok(other) => {
                        warn!(peer = %peer.fmt_short(), kind = other.kind(), "unexpected response to manifest request");
                    }
                    Err(e) => {
                        debug!(%address, peer = %peer.fmt_short(), %e, "manifest request failed");
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(NodeError::AddressResolution(format!(
                    "{address}: manifest not found"
                )));
            }
            tokio::time::sleep(RESOLVE_RETRY_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer", &self.peer_id())
            .finish_non_exhaustive()
    }
}
