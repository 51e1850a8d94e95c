//! TOML configuration for a Tide node.
//!
//! Every section and field is optional; missing values take defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tide_net::ChannelKind;
use tide_replication::ReplicationConfig;
use tide_types::PeerId;
use tracing_subscriber::EnvFilter;

use crate::error::{NodeError, Result};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage location.
    pub node: NodeSection,
    /// Replication tuning.
    pub replication: ReplicationConfig,
    /// Address resolution.
    pub address: AddressSection,
    /// iroh transport.
    pub network: NetworkSection,
    /// Logging.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for the content store and head cache. Everything stays in
    /// memory when unset.
    pub data_dir: Option<PathBuf>,
}

/// `[address]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AddressSection {
    /// How long to look for a manifest among peers before giving up.
    pub resolution_timeout_ms: u64,
}

impl Default for AddressSection {
    fn default() -> Self {
        Self {
            resolution_timeout_ms: 3000,
        }
    }
}

/// `[network]` section, used by [`Node::bind`](crate::Node::bind).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// `"direct"` for QUIC channels, `"topic"` for gossip channels.
    pub channel: ChannelKind,
    /// Use the public relay servers. Off means direct addresses only.
    pub relay: bool,
    /// Hex peer ids to greet on startup.
    pub bootstrap: Vec<String>,
}

impl NetworkSection {
    /// Parsed `bootstrap` ids.
    pub fn bootstrap_peers(&self) -> Result<Vec<PeerId>> {
        self.bootstrap
            .iter()
            .map(|id| {
                id.parse()
                    .map_err(|e| NodeError::Config(format!("bad bootstrap peer {id:?}: {e}")))
            })
            .collect()
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogSection {
    /// Filter for a `tracing_subscriber` fmt layer: `RUST_LOG` if set,
    /// otherwise `level`.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| NodeError::Config(format!("bad log level {:?}: {e}", self.level))),
        }
    }
}

/// Install a global fmt subscriber filtered by `log`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(log: &LogSection) -> Result<()> {
    let filter = log.env_filter()?;
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    Ok(())
}

impl NodeConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.address.resolution_timeout_ms)
    }
}
