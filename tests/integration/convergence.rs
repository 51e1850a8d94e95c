//! Integration test: deterministic order and idempotent merging.
//!
//! Peers that hold the same entries list them identically no matter how
//! the entries arrived, and seeing the same heads again changes nothing.

use std::time::Duration;

use tide_integration_tests::{
    Swarm, close_all, collect_until, drain, eventually, progress_hashes, replicated_total,
    subscribe_all, values,
};
use tide_log::StoreFetcher;
use tide_net::ChannelKind;
use tide_node::{Direction, ListOptions, LogOptions, StoreEvent};

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_concurrent_branches_list_identically() {
    let swarm = Swarm::new(3, ChannelKind::Direct);
    let stores = swarm
        .open_shared("order", LogOptions::default().with_access(swarm.writers(&[0, 1, 2])))
        .await;

    // Three disconnected branches with overlapping clock times.
    swarm.isolate(0);
    swarm.isolate(1);
    for i in 0..4 {
        for (p, store) in stores.iter().enumerate() {
            store.add(format!("{p}:{i}")).await.unwrap();
        }
    }
    swarm.rejoin(0);
    swarm.rejoin(1);

    eventually("all branches to merge", || {
        stores.iter().all(|s| s.len() == 12)
    })
    .await;

    let reference = values(&stores[0]);
    for store in &stores[1..] {
        assert_eq!(values(store), reference);
    }

    // Causal order with ties on clock time broken by hash.
    let listed = stores[0].list(ListOptions::all());
    for pair in listed.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            (a.clock().time, a.hash()) < (b.clock().time, b.hash()),
            "entries out of order"
        );
    }

    // Backward listing mirrors forward listing.
    let mut backward = stores[0].list(ListOptions::all().backward());
    backward.reverse();
    assert_eq!(
        backward.iter().map(|r| r.hash()).collect::<Vec<_>>(),
        listed.iter().map(|r| r.hash()).collect::<Vec<_>>()
    );
    assert_eq!(ListOptions::last(3).direction, Direction::Forward);
    assert_eq!(stores[0].list(ListOptions::last(3)).len(), 3);
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_merging_known_heads_is_a_no_op() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let stores = swarm.open_shared("idempotent", LogOptions::default()).await;
    let mut sub = subscribe_all(&stores[1], 256);

    for i in 0..10 {
        stores[0].add(format!("once-{i}")).await.unwrap();
    }
    let events = collect_until(&mut sub, |evs| replicated_total(evs) == 10).await;
    assert_eq!(progress_hashes(&events).len(), 10);
    let before = values(&stores[1]);

    // Merge the writer's heads again straight from its store.
    let fetcher = StoreFetcher::new(swarm.node(0).store().clone());
    let report = stores[1]
        .log()
        .merge(&stores[0].heads(), &fetcher)
        .await
        .unwrap();
    assert!(report.added.is_empty());
    assert!(report.rejected.is_empty());

    // Reconnecting re-announces heads the reader already holds.
    swarm.sever(0, 1);
    swarm.restore(0, 1);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let late = drain(&mut sub);
    assert!(
        late.iter()
            .all(|e| !matches!(e, StoreEvent::ReplicateProgress { .. })),
        "known entries reported again: {late:?}"
    );
    assert_eq!(replicated_total(&late), 0);
    assert_eq!(values(&stores[1]), before);
    assert_eq!(stores[1].len(), 10);
    close_all(stores).await;
}
