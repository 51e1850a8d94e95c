//! Integration test: replication over real iroh endpoints on loopback.
//!
//! Two nodes bind endpoints with relays disabled, learn each other's
//! direct addresses and replicate a log over QUIC and over gossip.

use std::collections::HashSet;
use std::time::Duration;

use tide_integration_tests::{
    collect_until, drain, eventually, fast_config, init_tracing, keypair, progress_hashes,
    replicated_total, subscribe_all, values,
};
use tide_net::{ChannelKind, IrohNetwork, NetError};
use tide_node::{LogOptions, Node, NodeError, StoreEvent};

/// Bind node `i`, or `None` where the sandbox cannot open UDP sockets.
async fn bind(i: usize, kind: ChannelKind) -> Option<(Node, IrohNetwork)> {
    let mut config = fast_config();
    config.network.channel = kind;
    match Node::bind(config, keypair(i)).await {
        Ok(bound) => Some(bound),
        Err(NodeError::Net(NetError::Endpoint(e))) => {
            eprintln!("skipping: cannot bind an iroh endpoint here: {e}");
            None
        }
        Err(e) => panic!("bind node {i}: {e}"),
    }
}

async fn replicate_over(kind: ChannelKind) {
    init_tracing();
    let Some((node_a, net_a)) = bind(0, kind).await else {
        return;
    };
    let Some((node_b, net_b)) = bind(1, kind).await else {
        return;
    };
    assert_eq!(net_a.local_id(), node_a.peer_id());
    net_a.add_peer(net_b.addr()).await;
    net_b.add_peer(net_a.addr()).await;

    let a = node_a.log("over-iroh", LogOptions::default()).await.unwrap();
    let b = node_b
        .log(&a.address().to_string(), LogOptions::default())
        .await
        .unwrap();
    eventually("peers see each other", || {
        a.peers().contains(&node_b.peer_id()) && b.peers().contains(&node_a.peer_id())
    })
    .await;

    let mut written = subscribe_all(&a, 64);
    let mut sub = subscribe_all(&b, 64);
    for i in 0..5 {
        a.add(format!("quic-{i}")).await.unwrap();
    }
    let mut events = collect_until(&mut sub, |evs| replicated_total(evs) == 5).await;
    assert_eq!(values(&b), values(&a));

    // Repeated broadcasts of the same heads report nothing new.
    tokio::time::sleep(Duration::from_millis(200)).await;
    events.extend(drain(&mut sub));
    let progress = progress_hashes(&events);
    assert_eq!(progress.len(), 5);
    assert_eq!(progress.iter().collect::<HashSet<_>>().len(), 5);
    assert_eq!(replicated_total(&events), 5);
    let writes = drain(&mut written)
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::Write { .. }))
        .count();
    assert_eq!(writes, 5);

    a.close().await;
    b.close().await;
    net_a.shutdown().await.unwrap();
    net_b.shutdown().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_replicate_over_quic() {
    replicate_over(ChannelKind::Direct).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_replicate_over_gossip() {
    replicate_over(ChannelKind::Topic).await;
}
