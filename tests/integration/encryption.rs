//! Integration test: encrypted logs.
//!
//! Peers sharing the key read each other's entries. A peer holding the
//! wrong key can open the log but accepts nothing from it.

use tide_crypto::SharedKey;
use tide_integration_tests::{
    Swarm, close_all, collect_until, eventually, progress_hashes, replicated_total,
    subscribe_all, values,
};
use tide_net::ChannelKind;
use tide_node::{ListOptions, LogOptions, NodeError, StoreEvent};

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_same_key_replicates() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let key = SharedKey::generate();
    let stores = swarm
        .open_shared(
            "secret",
            LogOptions::default()
                .with_access(swarm.writers(&[0, 1]))
                .with_shared_key(key),
        )
        .await;
    assert!(stores[1].manifest().encrypted);

    stores[0].add("first secret").await.unwrap();
    stores[1].add("second secret").await.unwrap();

    eventually("both peers to decrypt both entries", || {
        stores.iter().all(|s| s.len() == 2)
    })
    .await;
    assert_eq!(values(&stores[0]), values(&stores[1]));
    let mut got = values(&stores[0]);
    got.sort();
    assert_eq!(got, ["first secret", "second secret"]);

    // Stored payloads are ciphertext.
    let record = stores[0].list(ListOptions::all()).remove(0);
    assert_ne!(record.entry.payload, record.value());
    close_all(stores).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_wrong_key_accepts_nothing() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let writer = swarm
        .node(0)
        .log(
            "secret",
            LogOptions::default().with_shared_key(SharedKey::generate()),
        )
        .await
        .unwrap();
    let reader = swarm
        .open_on(
            1,
            &writer.address().to_string(),
            LogOptions::default().with_shared_key(SharedKey::generate()),
        )
        .await;
    let mut sub = subscribe_all(&reader, 64);

    for i in 0..5 {
        writer.add(format!("hidden-{i}")).await.unwrap();
    }

    let events = collect_until(&mut sub, |evs| progress_hashes(evs).len() == 5).await;
    assert_eq!(replicated_total(&events), 0);
    assert!(events.iter().all(|e| !matches!(
        e,
        StoreEvent::ReplicateProgress {
            record: Some(_),
            ..
        }
    )));
    assert!(reader.is_empty());
    assert_eq!(writer.len(), 5);
    close_all(vec![writer, reader]).await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_missing_key_is_refused() {
    let swarm = Swarm::new(2, ChannelKind::Direct);
    let writer = swarm
        .node(0)
        .log(
            "secret",
            LogOptions::default().with_shared_key(SharedKey::generate()),
        )
        .await
        .unwrap();

    let err = swarm
        .node(1)
        .log(&writer.address().to_string(), LogOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::AddressResolution(_)));
    writer.close().await;
}
