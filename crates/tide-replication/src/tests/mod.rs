//! Tests for the replication coordinator.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tide_access::{AccessControlList, StaticList};
use tide_crypto::Keypair;
use tide_log::{HeadCache, HeadStore, ListOptions, Log, LogContext, LogError, Record};
use tide_net::{Channel, ChannelFactory, ChannelKind, MemoryNetwork};
use tide_store::MemoryStore;
use tide_types::events::{EventBus, SubscribeOptions, Subscription};
use tide_types::{ContentHash, PeerId, TopicId};

use crate::config::ReplicationConfig;
use crate::events::{EventKind, StoreEvent};
use crate::replicator::Replicator;

fn test_keypair(seed: u8) -> Keypair {
    Keypair::from_seed([seed; 32])
}

fn topic() -> TopicId {
    TopicId::for_address("/tide/test/replication")
}

/// Short timeouts so failure paths finish quickly.
fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        request_timeout_ms: 500,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        ..ReplicationConfig::default()
    }
}

/// A log plus its running replicator.
struct TestPeer {
    log: Arc<Log>,
    replicator: Replicator,
    bus: EventBus<StoreEvent>,
}

impl TestPeer {
    async fn add(&self, value: impl Into<Vec<u8>>) -> Record {
        let record = self.log.add(value).await.unwrap();
        self.replicator.announce().unwrap();
        record
    }

    fn subscribe(&self) -> Subscription<StoreEvent> {
        self.bus
            .subscribe(EventKind::ALL, SubscribeOptions::buffer(1024))
            .unwrap()
    }

    fn values(&self) -> Vec<String> {
        self.log
            .list(ListOptions::all())
            .iter()
            .map(|r| String::from_utf8_lossy(r.value()).into_owned())
            .collect()
    }
}

/// Head store whose writes fail while `failing` is set.
struct FlakyHeads {
    inner: HeadCache,
    failing: AtomicBool,
}

impl FlakyHeads {
    fn new() -> Self {
        Self {
            inner: HeadCache::in_memory(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HeadStore for FlakyHeads {
    fn load(&self, log_id: &str) -> tide_log::Result<Vec<ContentHash>> {
        self.inner.load(log_id)
    }

    fn store(&self, log_id: &str, heads: &[ContentHash]) -> tide_log::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogError::Cache("no space left on device".to_string()));
        }
        self.inner.store(log_id, heads)
    }
}

/// In-memory log for `seed`, writable by `writers`.
fn test_log(seed: u8, writers: &[u8], heads: Arc<dyn HeadStore>) -> Arc<Log> {
    let acl = AccessControlList::writers(writers.iter().map(|w| test_keypair(*w).identity().id));
    Arc::new(Log::new(
        "replicated",
        LogContext {
            access: Arc::new(StaticList::new(acl)),
            shared_key: None,
            store: Arc::new(MemoryStore::new()),
            cache: heads,
            keypair: test_keypair(seed),
        },
    ))
}

async fn spawn_peer(
    network: &MemoryNetwork,
    seed: u8,
    writers: &[u8],
    config: ReplicationConfig,
) -> TestPeer {
    spawn_peer_with_heads(network, seed, writers, config, Arc::new(HeadCache::in_memory())).await
}

async fn spawn_peer_with_heads(
    network: &MemoryNetwork,
    seed: u8,
    writers: &[u8],
    config: ReplicationConfig,
    heads: Arc<dyn HeadStore>,
) -> TestPeer {
    let log = test_log(seed, writers, heads);
    let channel = network
        .factory(test_keypair(seed).peer_id(), ChannelKind::Direct)
        .open(topic())
        .await
        .unwrap();
    let bus = EventBus::new();
    let replicator = Replicator::start(log.clone(), channel, bus.clone(), config, None);
    TestPeer {
        log,
        replicator,
        bus,
    }
}

/// A bare channel on the test topic, for poking a replicator directly.
async fn raw_channel(network: &MemoryNetwork, seed: u8) -> Arc<dyn Channel> {
    network
        .factory(PeerId::from([seed; 32]), ChannelKind::Direct)
        .open(topic())
        .await
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

/// Receive events until `done` holds for everything received so far.
async fn collect_until(
    sub: &mut Subscription<StoreEvent>,
    done: impl Fn(&[StoreEvent]) -> bool,
) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while !done(&events) {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => panic!("event bus closed"),
            Err(_) => panic!("timed out after {} events: {events:?}", events.len()),
        }
    }
    events
}

/// Sum of `log_length` over the `Replicated` events.
fn replicated_total(events: &[StoreEvent]) -> usize {
    events
        .iter()
        .map(|e| match e {
            StoreEvent::Replicated { log_length, .. } => *log_length,
            _ => 0,
        })
        .sum()
}
