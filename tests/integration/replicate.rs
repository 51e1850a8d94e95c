//! Integration test: two-peer replication.
//!
//! One peer writes, the other receives. Event counts must be exact: one
//! `ReplicateProgress` per entry, and `Replicated` lengths summing to the
//! number of entries written.

use std::collections::HashSet;

use tide_integration_tests::{
    Swarm, close_all, collect_until, eventually, progress_hashes, replicated_total,
    subscribe_all, values,
};
use tide_net::ChannelKind;
use tide_node::{LogOptions, StoreEvent};

/// Write `n` entries on node 0 and check node 1 sees each exactly once.
async fn replicate_n(kind: ChannelKind, n: usize) {
    let swarm = Swarm::new(2, kind);
    let stores = swarm
        .open_shared("replicate", LogOptions::default().with_access(swarm.writers(&[0])))
        .await;
    let mut sub = subscribe_all(&stores[1], 4 * n + 16);

    let mut written = Vec::new();
    for i in 0..n {
        written.push(stores[0].add(format!("entry-{i}")).await.unwrap().hash());
    }

    let events = collect_until(&mut sub, |evs| replicated_total(evs) == n).await;
    let progress = progress_hashes(&events);
    assert_eq!(progress.len(), n, "one progress event per entry");
    assert_eq!(
        progress.iter().collect::<HashSet<_>>(),
        written.iter().collect::<HashSet<_>>()
    );
    assert!(
        events
            .iter()
            .all(|e| !matches!(e, StoreEvent::Write { .. })),
        "the receiver wrote nothing"
    );

    assert_eq!(stores[1].len(), n);
    assert_eq!(values(&stores[1]), values(&stores[0]));
    assert_eq!(values(&stores[1]).last().unwrap(), &format!("entry-{}", n - 1));
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_replicate_one_entry() {
    replicate_n(ChannelKind::Direct, 1).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_replicate_ten_entries() {
    replicate_n(ChannelKind::Direct, 10).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_replicate_hundred_entries() {
    replicate_n(ChannelKind::Direct, 100).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_replicate_over_topic_channel() {
    replicate_n(ChannelKind::Topic, 10).await;
}

/// Progress events carry the decoded record of each entry.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_progress_carries_records() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let stores = swarm.open_shared("records", LogOptions::default()).await;
    let mut sub = subscribe_all(&stores[1], 64);

    let written = stores[0].add("hello world").await.unwrap();
    let events = collect_until(&mut sub, |evs| replicated_total(evs) == 1).await;

    let (peer, record) = events
        .iter()
        .find_map(|e| match e {
            StoreEvent::ReplicateProgress { peer, record, .. } => Some((*peer, record.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(peer, swarm.peer_id(0));
    let record = record.expect("accepted entry has a record");
    assert_eq!(record.hash(), written.hash());
    assert_eq!(record.value(), b"hello world");
    close_all(stores).await;
}

/// A peer opening an existing log by address receives its history.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_late_joiner_receives_history() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let first = swarm
        .node(0)
        .log("history", LogOptions::default())
        .await
        .unwrap();
    for i in 0..20 {
        first.add(format!("old-{i}")).await.unwrap();
    }

    let late = swarm
        .open_on(1, &first.address().to_string(), LogOptions::default())
        .await;
    eventually("late joiner to receive history", || late.len() == 20).await;
    assert_eq!(values(&late), values(&first));
    close_all(vec![first, late]).await;
}
