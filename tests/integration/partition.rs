//! Integration test: network partitions.
//!
//! Peers keep writing while links are cut. Entries reach the far side
//! through intermediate peers, and everything converges once links heal.

use std::time::Duration;

use tide_integration_tests::{Swarm, close_all, eventually, values};
use tide_net::ChannelKind;
use tide_node::LogOptions;

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_entries_route_around_a_cut_link() {
    let swarm = Swarm::new(3, ChannelKind::Direct);
    let stores = swarm
        .open_shared("relay", LogOptions::default().with_access(swarm.writers(&[0])))
        .await;
    swarm.sever(0, 2);

    for i in 0..5 {
        stores[0].add(format!("relayed-{i}")).await.unwrap();
    }
    eventually("node 2 to learn entries through node 1", || {
        stores[2].len() == 5
    })
    .await;
    assert_eq!(values(&stores[2]), values(&stores[0]));
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_partition_heals() {
    let swarm = Swarm::new(4, ChannelKind::Direct);
    let stores = swarm
        .open_shared(
            "partition",
            LogOptions::default().with_access(swarm.writers(&[0, 1, 2, 3])),
        )
        .await;

    // {0, 1} | {2, 3}
    for (a, b) in [(0, 2), (0, 3), (1, 2), (1, 3)] {
        swarm.sever(a, b);
    }
    for i in 0..5 {
        stores[0].add(format!("left-{i}")).await.unwrap();
        stores[3].add(format!("right-{i}")).await.unwrap();
    }
    eventually("each side to converge internally", || {
        stores[1].len() == 5 && stores[2].len() == 5
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(values(&stores[1]).iter().all(|v| v.starts_with("left-")));
    assert!(values(&stores[2]).iter().all(|v| v.starts_with("right-")));

    for (a, b) in [(0, 2), (0, 3), (1, 2), (1, 3)] {
        swarm.restore(a, b);
    }
    eventually("all peers to hold both sides", || {
        stores.iter().all(|s| s.len() == 10)
    })
    .await;
    let reference = values(&stores[0]);
    for store in &stores[1..] {
        assert_eq!(values(store), reference);
    }
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_isolated_writer_catches_up_over_topic() {
    let swarm = Swarm::new(3, ChannelKind::Topic);
    let stores = swarm
        .open_shared(
            "isolated",
            LogOptions::default().with_access(swarm.writers(&[0, 1, 2])),
        )
        .await;

    swarm.isolate(2);
    stores[0].add("while away").await.unwrap();
    stores[2].add("offline note").await.unwrap();
    eventually("node 1 to see node 0's entry", || stores[1].len() == 1).await;
    assert_eq!(stores[2].len(), 1);

    swarm.rejoin(2);
    eventually("everyone to hold both entries", || {
        stores.iter().all(|s| s.len() == 2)
    })
    .await;
    assert_eq!(values(&stores[0]), values(&stores[2]));
    close_all(stores).await;
}
