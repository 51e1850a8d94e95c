use tide_crypto::SharedKey;
use tide_types::ContentHash;

use super::{encrypted_log, test_context, test_log, values};
use crate::error::LogError;
use crate::oplog::{Amount, Direction, ListOptions, Log};

#[tokio::test]
async fn test_add_returns_record_and_moves_head() {
    let log = test_log(1, &[1]);
    assert!(log.is_empty());
    assert!(log.heads().is_empty());

    let record = log.add("hello0").await.unwrap();
    assert_eq!(record.value(), b"hello0");
    assert!(record.entry.predecessors.is_empty());
    assert_eq!(log.heads(), vec![record.hash()]);
    assert_eq!(log.len(), 1);
    assert!(log.contains(&record.hash()));
}

#[tokio::test]
async fn test_add_links_previous_head_and_ticks_clock() {
    let log = test_log(1, &[1]);
    let first = log.add("a").await.unwrap();
    let second = log.add("b").await.unwrap();

    assert_eq!(second.entry.predecessors, vec![first.hash()]);
    assert!(second.clock().time > first.clock().time);
    assert_eq!(second.clock().owner, log.identity().id);
    assert_eq!(log.heads(), vec![second.hash()]);
    assert_eq!(log.clock_time(), second.clock().time);
}

#[tokio::test]
async fn test_add_persists_entry_under_its_hash() {
    let ctx = test_context(1, &[1], None);
    let store = ctx.store.clone();
    let log = Log::new("log", ctx);

    let record = log.add("durable").await.unwrap();
    let bytes = store.get(record.hash()).await.unwrap().unwrap();
    assert_eq!(ContentHash::from_data(&bytes), record.hash());
    assert_eq!(bytes.as_ref(), record.entry.to_bytes().unwrap());
}

#[tokio::test]
async fn test_add_without_write_capability_is_denied() {
    // Seed 2 is not a writer.
    let log = test_log(2, &[1]);
    let err = log.add("nope").await.unwrap_err();
    assert!(matches!(err, LogError::AccessDenied(_)));
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_list_forward_order() {
    let log = test_log(1, &[1]);
    for i in 0..10 {
        log.add(format!("hello{i}")).await.unwrap();
    }

    let all = log.list(ListOptions::all());
    assert_eq!(all.len(), 10);
    assert_eq!(values(&all)[0], "hello0");
    assert_eq!(values(&all)[9], "hello9");
}

#[tokio::test]
async fn test_list_amount_and_direction() {
    let log = test_log(1, &[1]);
    for i in 0..5 {
        log.add(format!("v{i}")).await.unwrap();
    }

    assert_eq!(values(&log.list(ListOptions::last(2))), vec!["v3", "v4"]);
    assert_eq!(
        values(&log.list(ListOptions::last(2).backward())),
        vec!["v4", "v3"]
    );
    assert_eq!(
        values(&log.list(ListOptions::all().backward()))[0],
        "v4".to_string()
    );
    assert_eq!(log.list(ListOptions::last(50)).len(), 5);
    assert!(log.list(ListOptions::last(0)).is_empty());

    let sentinel = ListOptions {
        amount: Amount::from(-1),
        direction: Direction::Forward,
    };
    assert_eq!(log.list(sentinel).len(), 5);
    assert_eq!(Amount::from(3), Amount::Limit(3));
}

#[tokio::test]
async fn test_encrypted_payload_is_opaque() {
    let log = encrypted_log(1, &[1], SharedKey::from_bytes([9u8; 32]));
    assert!(log.is_encrypted());

    let record = log.add("secret value").await.unwrap();
    assert_eq!(record.value(), b"secret value");

    let payload = &record.entry.payload;
    assert!(
        !payload
            .windows(b"secret value".len())
            .any(|w| w == b"secret value")
    );
    assert_eq!(values(&log.list(ListOptions::all())), vec!["secret value"]);
}

#[tokio::test]
async fn test_concurrent_adds_are_serialized() {
    let log = std::sync::Arc::new(test_log(1, &[1]));

    let mut handles = Vec::new();
    for i in 0..20 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            log.add(format!("c{i}")).await.unwrap()
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // Every append saw the previous one: a single chain, a single head.
    assert_eq!(log.len(), 20);
    assert_eq!(log.heads().len(), 1);

    let listed = log.list(ListOptions::all());
    for pair in listed.windows(2) {
        assert_eq!(pair[1].entry.predecessors, vec![pair[0].hash()]);
    }
}

#[tokio::test]
async fn test_collect_for_peer_stops_at_have_and_limit() {
    let log = test_log(1, &[1]);
    let mut hashes = Vec::new();
    for i in 0..6 {
        hashes.push(log.add(format!("e{i}")).await.unwrap().hash());
    }

    // Everything, parents first.
    let all = log.collect_for_peer(&log.heads(), &[], usize::MAX).unwrap();
    let all_hashes: Vec<ContentHash> = all.iter().map(|b| ContentHash::from_data(b)).collect();
    assert_eq!(all_hashes, hashes);

    // The requester already has e2.
    let delta = log.collect_for_peer(&log.heads(), &[hashes[2]], usize::MAX).unwrap();
    let delta_hashes: Vec<ContentHash> = delta.iter().map(|b| ContentHash::from_data(b)).collect();
    assert_eq!(delta_hashes, hashes[3..].to_vec());

    // Limited walks keep the entries closest to the requested heads.
    let limited = log.collect_for_peer(&log.heads(), &[], 2).unwrap();
    let limited_hashes: Vec<ContentHash> =
        limited.iter().map(|b| ContentHash::from_data(b)).collect();
    assert_eq!(limited_hashes, hashes[4..].to_vec());

    // Unknown hashes are skipped.
    let unknown = log
        .collect_for_peer(&[ContentHash::from_data(b"nope")], &[], usize::MAX)
        .unwrap();
    assert!(unknown.is_empty());
}
