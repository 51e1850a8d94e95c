//! Shared test harness for Tide integration tests.
//!
//! Provides [`Swarm`]: N nodes on one in-process [`MemoryNetwork`], with
//! helpers to open one log on all of them, cut and heal links, and wait for
//! replication events.

use std::sync::{Arc, Once};
use std::time::Duration;

use tide_access::AccessControlList;
use tide_crypto::Keypair;
use tide_net::{ChannelKind, MemoryNetwork};
use tide_node::{EventLogStore, ListOptions, LogOptions, Node, NodeConfig, StoreEvent};
use tide_types::events::Subscription;
use tide_types::{ContentHash, PeerId};

pub use tide_node::EventKind;
pub use tide_types::events::SubscribeOptions;

/// How long [`eventually`] and [`collect_until`] wait before failing.
const WAIT: Duration = Duration::from_secs(10);

// =========================================================================
// Tracing
// =========================================================================

static TRACING: Once = Once::new();

/// Install a `fmt` subscriber once per test binary.
///
/// Filtered by the `[log]` section of [`fast_config`], so `RUST_LOG` wins
/// and only warnings are shown otherwise.
pub fn init_tracing() {
    TRACING.call_once(|| {
        use tracing_subscriber::EnvFilter;

        let filter = fast_config()
            .log
            .env_filter()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// =========================================================================
// Swarm
// =========================================================================

/// Node config with timeouts short enough for tests.
pub fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.log.level = "warn".to_string();
    config.address.resolution_timeout_ms = 2000;
    config.replication.request_timeout_ms = 500;
    config.replication.backoff_base_ms = 10;
    config.replication.backoff_max_ms = 50;
    config
}

/// Keypair of node `i`.
pub fn keypair(i: usize) -> Keypair {
    Keypair::from_seed([i as u8 + 1; 32])
}

/// N in-memory nodes sharing one network.
pub struct Swarm {
    network: MemoryNetwork,
    nodes: Vec<Node>,
}

impl Swarm {
    /// Create `n` nodes whose channels are of flavour `kind`.
    pub fn new(n: usize, kind: ChannelKind) -> Self {
        Self::with_config(n, kind, fast_config())
    }

    pub fn with_config(n: usize, kind: ChannelKind, config: NodeConfig) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let nodes = (0..n)
            .map(|i| {
                let keypair = keypair(i);
                let factory = network.factory(keypair.peer_id(), kind);
                Node::open(config.clone(), keypair, Arc::new(factory))
                    .expect("in-memory node never fails to open")
            })
            .collect();
        Self { network, nodes }
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    pub fn peer_id(&self, i: usize) -> PeerId {
        self.nodes[i].peer_id()
    }

    /// Identity id (hex public key) of node `i`.
    pub fn identity_id(&self, i: usize) -> String {
        self.nodes[i].identity().id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Access list granting `write` to the given nodes.
    pub fn writers(&self, nodes: &[usize]) -> AccessControlList {
        AccessControlList::writers(nodes.iter().map(|&i| self.identity_id(i)))
    }

    /// Node 0 creates `name` with `options`; every other node opens it by
    /// address with the same shared key.
    pub async fn open_shared(&self, name: &str, options: LogOptions) -> Vec<EventLogStore> {
        let first = self.nodes[0]
            .log(name, options.clone())
            .await
            .expect("create log");
        let address = first.address().to_string();

        let mut stores = vec![first];
        for node in &self.nodes[1..] {
            stores.push(
                node.log(&address, reader_options(&options))
                    .await
                    .expect("open log by address"),
            );
        }
        stores
    }

    /// Open `address` on node `i`.
    pub async fn open_on(&self, i: usize, address: &str, options: LogOptions) -> EventLogStore {
        self.nodes[i]
            .log(address, options)
            .await
            .expect("open log by address")
    }

    /// Cut the link between nodes `i` and `j`.
    pub fn sever(&self, i: usize, j: usize) {
        self.network.sever(self.peer_id(i), self.peer_id(j));
    }

    /// Heal the link between nodes `i` and `j`.
    pub fn restore(&self, i: usize, j: usize) {
        self.network.restore(self.peer_id(i), self.peer_id(j));
    }

    /// Cut every link of node `i`.
    pub fn isolate(&self, i: usize) {
        for j in (0..self.len()).filter(|&j| j != i) {
            self.sever(i, j);
        }
    }

    /// Heal every link of node `i`.
    pub fn rejoin(&self, i: usize) {
        for j in (0..self.len()).filter(|&j| j != i) {
            self.restore(i, j);
        }
    }
}

/// Readers only carry the key; the access list comes from the manifest.
fn reader_options(options: &LogOptions) -> LogOptions {
    LogOptions {
        access: None,
        shared_key: options.shared_key.clone(),
    }
}

// =========================================================================
// Waiting and inspecting
// =========================================================================

/// Poll `check` until it holds, panicking after a while.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every event kind with room for `capacity` undelivered events.
pub fn subscribe_all(store: &EventLogStore, capacity: usize) -> Subscription<StoreEvent> {
    store
        .subscribe(EventKind::ALL, SubscribeOptions::buffer(capacity))
        .expect("subscribe")
}

/// Receive events until `done` holds for everything received so far.
pub async fn collect_until(
    sub: &mut Subscription<StoreEvent>,
    done: impl Fn(&[StoreEvent]) -> bool,
) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while !done(&events) {
        match tokio::time::timeout(WAIT, sub.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => panic!("event bus closed after {} events", events.len()),
            Err(_) => panic!("timed out after {} events", events.len()),
        }
    }
    events
}

/// Events already delivered, without waiting.
pub fn drain(sub: &mut Subscription<StoreEvent>) -> Vec<StoreEvent> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

/// Sum of `log_length` over the `Replicated` events.
pub fn replicated_total(events: &[StoreEvent]) -> usize {
    events
        .iter()
        .map(|e| match e {
            StoreEvent::Replicated { log_length, .. } => *log_length,
            _ => 0,
        })
        .sum()
}

/// Hashes of the `ReplicateProgress` events, in arrival order.
pub fn progress_hashes(events: &[StoreEvent]) -> Vec<ContentHash> {
    events
        .iter()
        .filter_map(|e| match e {
            StoreEvent::ReplicateProgress { hash, .. } => Some(*hash),
            _ => None,
        })
        .collect()
}

/// Values of the whole log, in list order, as UTF-8.
pub fn values(store: &EventLogStore) -> Vec<String> {
    store
        .list(ListOptions::all())
        .iter()
        .map(|r| String::from_utf8_lossy(r.value()).into_owned())
        .collect()
}

/// Close every store.
pub async fn close_all(stores: Vec<EventLogStore>) {
    for store in stores {
        store.close().await;
    }
}
