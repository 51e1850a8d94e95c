//! Tests for the node facade.


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tide_crypto::Keypair;
use tide_net::{ChannelKind, MemoryNetwork};

use crate::config::NodeConfig;
use crate::node::Node;

fn test_keypair(seed: u8) -> Keypair {
    Keypair::from_seed([seed; 32])
}

/// In-memory config with short timeouts.
fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.address.resolution_timeout_ms = 300;
    config.replication.request_timeout_ms = 200;
    config.replication.backoff_base_ms = 10;
    config.replication.backoff_max_ms = 50;
    config
}

fn memory_node(network: &MemoryNetwork, seed: u8) -> Node {
    Node::open(
        fast_config(),
        test_keypair(seed),
        Arc::new(network.factory(test_keypair(seed).peer_id(), ChannelKind::Direct)),
    )
    .unwrap()
}

fn disk_node(network: &MemoryNetwork, seed: u8, dir: &Path) -> Node {
    let mut config = fast_config();
    config.node.data_dir = Some(dir.to_path_buf());
    Node::open(
        config,
        test_keypair(seed),
        Arc::new(network.factory(test_keypair(seed).peer_id(), ChannelKind::Direct)),
    )
    .unwrap()
}

/// Poll `check` until it holds, panicking after five seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
