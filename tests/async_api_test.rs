mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{event, eventually, sequences, types};
use ledgerdb::clock::ManualClock;
use ledgerdb::advisory::InProcessLocks;
use ledgerdb::{
    Error, EventData, EventStore, ExpectedVersion, ObtainOutcome, PartitionKey, ReadSpec,
    RefreshOutcome, ReleaseOutcome, StoreConfig, Stream, WorkerId,
};

fn config() -> StoreConfig {
    StoreConfig {
        reader_threads: Some(2),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn streams_links_and_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open_with_config(dir.path().join("store.db"), config())
        .await
        .unwrap();

    let placed = store
        .append(
            vec![event("OrderPlaced"), event("OrderPaid")],
            Stream::new("order-1"),
            ExpectedVersion::NoStream,
        )
        .await
        .unwrap();
    let paid = placed.event_ids[1];

    store
        .link(vec![paid], Stream::new("payments"), ExpectedVersion::Auto)
        .await
        .unwrap();

    let order = store.read(ReadSpec::stream("order-1")).await.unwrap();
    assert_eq!(types(&order), ["OrderPlaced", "OrderPaid"]);

    assert_eq!(
        store.streams_of(paid).await.unwrap(),
        vec![Stream::new("order-1"), Stream::new("payments")]
    );
    assert_eq!(
        store
            .position_in_stream(paid, Stream::new("payments"))
            .await
            .unwrap()
            .map(|p| p.as_raw()),
        Some(0)
    );
    assert_eq!(store.global_position(paid).await.unwrap().as_raw(), 2);
    assert!(store.event_in_stream(paid, Stream::Global).await.unwrap());
    assert_eq!(
        store
            .last_stream_event(Stream::new("order-1"))
            .await
            .unwrap()
            .map(|e| e.event_id),
        Some(paid)
    );

    let err = store
        .append(vec![event("Again")], Stream::new("order-1"), ExpectedVersion::NoStream)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongExpectedVersion { .. }));

    store.shutdown().await;
}

#[tokio::test]
async fn update_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open_with_config(dir.path().join("store.db"), config())
        .await
        .unwrap();

    let id = store
        .append(vec![event("Draft")], Stream::new("doc"), ExpectedVersion::Auto)
        .await
        .unwrap()
        .event_ids[0];

    store
        .update_messages(vec![EventData::new("Final", b"v2".to_vec()).with_id(id)])
        .await
        .unwrap();
    let doc = store.read(ReadSpec::stream("doc")).await.unwrap();
    assert_eq!((doc[0].event_type.as_str(), doc[0].data.as_slice()), ("Final", &b"v2"[..]));

    assert_eq!(store.delete_stream(Stream::new("doc")).await.unwrap(), 1);
    assert!(store.read(ReadSpec::stream("doc")).await.unwrap().is_empty());
    assert!(store.has_event(id).await.unwrap());
    assert_eq!(store.count(ReadSpec::global()).await.unwrap(), 1);

    store.shutdown().await;
}

#[tokio::test]
async fn leases_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(5_000);
    let store = EventStore::open_with_parts(
        dir.path().join("store.db"),
        config(),
        Arc::new(InProcessLocks::new()),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    let partition = PartitionKey::new("email", "0");

    let lease = match store
        .obtain_lease(partition.clone(), WorkerId::new("w1"))
        .await
        .unwrap()
    {
        ObtainOutcome::Obtained(lease) => lease,
        other => panic!("expected Obtained, got {other:?}"),
    };
    assert_eq!(
        store
            .obtain_lease(partition.clone(), WorkerId::new("w2"))
            .await
            .unwrap(),
        ObtainOutcome::Taken
    );

    clock.advance(Duration::from_secs(11));
    assert!(matches!(
        store
            .obtain_lease(partition.clone(), WorkerId::new("w2"))
            .await
            .unwrap(),
        ObtainOutcome::Obtained(_)
    ));
    assert_eq!(store.refresh_lease(lease).await.unwrap(), RefreshOutcome::Stolen);
    assert_eq!(
        store
            .release_lease(partition, WorkerId::new("w1"))
            .await
            .unwrap(),
        ReleaseOutcome::NotTakenByThisProcess
    );

    store.shutdown().await;
}

#[tokio::test]
async fn two_stores_on_one_file_see_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = EventStore::open_with_config(&path, config()).await.unwrap();
    let b = EventStore::open_with_config(&path, config()).await.unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            tokio::spawn(async move {
                store
                    .append(vec![event("E")], Stream::new("shared"), ExpectedVersion::Auto)
                    .await
                    .unwrap()
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let page = a.read_after(0, 100).await.unwrap();
    assert_eq!(sequences(&page), (1..=20).collect::<Vec<_>>());
    assert_eq!(a.watermark(), 20);

    let events = b.read(ReadSpec::stream("shared")).await.unwrap();
    let positions: Vec<u64> = events
        .iter()
        .filter_map(|e| e.position.map(|p| p.as_raw()))
        .collect();
    assert_eq!(positions, (0..20).collect::<Vec<_>>());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn cursor_follows_live_appends() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open_with_config(dir.path().join("live.db"), config())
        .await
        .unwrap();

    let writer = store.clone();
    let producer = tokio::spawn(async move {
        for _ in 0..50 {
            writer
                .append(vec![event("Tick")], Stream::Global, ExpectedVersion::Any)
                .await
                .unwrap();
        }
    });

    let mut seen = Vec::new();
    let mut last = 0;
    while seen.len() < 50 {
        let page = store.read_after(last, 8).await.unwrap();
        if let Some(tail) = page.last() {
            last = tail.global_sequence.as_raw();
            seen.extend(sequences(&page));
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    producer.await.unwrap();
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());

    let total = eventually(Duration::from_secs(2), Duration::from_millis(5), || {
        Some(store.watermark()).filter(|w| *w == 50)
    })
    .await;
    assert_eq!(total, 50);

    store.shutdown().await;
}
