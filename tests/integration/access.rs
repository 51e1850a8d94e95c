//! Integration test: write access.
//!
//! Only identities on the manifest's access list may append, and the list
//! travels with the address.

use tide_access::AccessControlList;
use tide_integration_tests::{Swarm, close_all, eventually, values};
use tide_log::LogError;
use tide_net::ChannelKind;
use tide_node::{LogOptions, NodeError};

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_reader_cannot_write() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let stores = swarm
        .open_shared("owned", LogOptions::default().with_access(swarm.writers(&[0])))
        .await;

    stores[0].add("by owner").await.unwrap();
    eventually("reader to replicate", || stores[1].len() == 1).await;

    let err = stores[1].add("by reader").await.unwrap_err();
    match err {
        NodeError::Log(LogError::AccessDenied(e)) => {
            assert!(e.to_string().contains(&swarm.identity_id(1)));
        }
        other => panic!("expected access denied, got {other:?}"),
    }
    assert_eq!(stores[1].len(), 1);
    assert_eq!(values(&stores[0]), ["by owner"]);
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_default_access_is_creator_only() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let stores = swarm.open_shared("default", LogOptions::default()).await;

    assert!(stores[0].add("mine").await.is_ok());
    assert!(matches!(
        stores[1].add("theirs").await,
        Err(NodeError::Log(LogError::AccessDenied(_)))
    ));
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_open_log_accepts_everyone() {
    let swarm = Swarm::new(3, ChannelKind::Direct);
    let stores = swarm
        .open_shared("open", LogOptions::default().with_access(AccessControlList::open()))
        .await;

    for (i, store) in stores.iter().enumerate() {
        store.add(format!("from {i}")).await.unwrap();
    }
    eventually("everyone to see every entry", || {
        stores.iter().all(|s| s.len() == 3)
    })
    .await;
    assert_eq!(values(&stores[0]), values(&stores[2]));
    close_all(stores).await;
}
