//! Integration test: many writers.
//!
//! Every peer writes concurrently to one log. All peers must converge to
//! the same entries, each value exactly once, in the same order, and
//! report every local write and every remote entry exactly once.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tide_integration_tests::{
    Swarm, close_all, collect_until, drain, eventually, progress_hashes, replicated_total,
    subscribe_all, values,
};
use tide_net::ChannelKind;
use tide_node::{EventLogStore, LogOptions, StoreEvent};

const PER_PEER: usize = 5;

async fn converge(n: usize, kind: ChannelKind) {
    let swarm = Swarm::new(n, kind);
    let all: Vec<usize> = (0..n).collect();
    let stores = swarm
        .open_shared("multipeer", LogOptions::default().with_access(swarm.writers(&all)))
        .await;
    let mut subs: Vec<_> = stores.iter().map(|s| subscribe_all(s, 4096)).collect();

    // Interleave writers so merges race with appends.
    for i in 0..PER_PEER {
        for (p, store) in stores.iter().enumerate() {
            store.add(format!("peer{p}-{i}")).await.unwrap();
        }
    }

    let total = n * PER_PEER;
    eventually("every peer to hold every entry", || {
        stores.iter().all(|s| s.len() == total)
    })
    .await;

    let reference = values(&stores[0]);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in &reference {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    assert_eq!(counts.len(), total);
    assert!(counts.values().all(|&c| c == 1), "a value appeared twice");

    for store in &stores[1..] {
        assert_eq!(values(store), reference);
        assert_eq!(store.heads(), stores[0].heads());
    }
    assert_each_writer_in_order(&stores[0], n);

    let remote = total - PER_PEER;
    for (p, sub) in subs.iter_mut().enumerate() {
        let mut events = collect_until(sub, |evs| {
            progress_hashes(evs).len() >= remote && replicated_total(evs) >= remote
        })
        .await;
        // Anything late would be a duplicate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        events.extend(drain(sub));

        let writes = events
            .iter()
            .filter(|e| matches!(e, StoreEvent::Write { .. }))
            .count();
        assert_eq!(writes, PER_PEER, "peer {p} write events");

        let progress = progress_hashes(&events);
        let unique: HashSet<_> = progress.iter().collect();
        assert_eq!(progress.len(), remote, "peer {p} progress events");
        assert_eq!(unique.len(), remote, "peer {p} reported an entry twice");
        assert_eq!(replicated_total(&events), remote, "peer {p} replicated total");
    }
    close_all(stores).await;
}

/// A writer's own entries keep their append order in the merged list.
fn assert_each_writer_in_order(store: &EventLogStore, n: usize) {
    let listed = values(store);
    for p in 0..n {
        let own: Vec<&String> = listed
            .iter()
            .filter(|v| v.starts_with(&format!("peer{p}-")))
            .collect();
        let expected: Vec<String> = (0..PER_PEER).map(|i| format!("peer{p}-{i}")).collect();
        assert_eq!(own, expected.iter().collect::<Vec<_>>());
    }
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_two_peers_converge() {
    converge(2, ChannelKind::Direct).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_five_peers_converge() {
    converge(5, ChannelKind::Direct).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_ten_peers_converge() {
    converge(10, ChannelKind::Direct).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_two_peers_converge_over_topic() {
    converge(2, ChannelKind::Topic).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_five_peers_converge_over_topic() {
    converge(5, ChannelKind::Topic).await;
}
