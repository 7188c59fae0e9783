mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{create_temp_db_file, cursor, event, manual_clock, repository};
use ledgerdb::clock::Clock;
use ledgerdb::{
    Consumer, ConsumerConfig, Database, Event, ExpectedVersion, LeaseLock, ObtainOutcome,
    PartitionKey, Result, Stream, WorkerId,
};

fn tenant_of(event: &Event) -> String {
    String::from_utf8_lossy(&event.metadata).into_owned()
}

#[test]
fn expired_rival_lease_unblocks_the_partition() {
    let (_dir, path) = create_temp_db_file("consumer.db");
    let clock = manual_clock();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let repo = repository(&path, Arc::clone(&shared));

    for tenant in ["acme", "globex", "acme", "initech"] {
        repo.append(
            vec![event("Notify").with_metadata(tenant.as_bytes().to_vec())],
            &Stream::new(format!("outbox-{tenant}")),
            ExpectedVersion::Auto,
        )
        .unwrap();
    }

    // A crashed worker still holds "globex".
    let rival = LeaseLock::new(Database::open(&path).unwrap(), Arc::clone(&shared));
    assert!(matches!(
        rival
            .obtain(&PartitionKey::new("notify", "globex"), &WorkerId::new("crashed"))
            .unwrap(),
        ObtainOutcome::Obtained(_)
    ));

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let mut consumer = Consumer::new(
        cursor(&path),
        LeaseLock::new(Database::open(&path).unwrap(), shared),
        WorkerId::new("live"),
        ConsumerConfig::new("notify"),
        tenant_of,
        move |partition: &PartitionKey, events: &[Event]| -> Result<()> {
            let mut sink = sink.lock().unwrap();
            for e in events {
                sink.push((partition.split_key.clone(), e.global_sequence.as_raw()));
            }
            Ok(())
        },
    );

    let tick = consumer.run_once().unwrap();
    assert_eq!(tick.deferred, 1);
    assert_eq!(consumer.position(), 1);

    clock.advance(Duration::from_secs(10));
    let tick = consumer.run_once().unwrap();
    assert_eq!(tick.deferred, 0);
    assert_eq!(consumer.position(), 4);

    let delivered = delivered.lock().unwrap();
    // Everything arrived; events past the stuck partition arrived twice.
    for seq in 1..=4 {
        assert!(delivered.iter().any(|(_, s)| *s == seq), "missing {seq}");
    }
    assert_eq!(
        delivered.iter().filter(|(k, _)| k == "globex").count(),
        1
    );
    assert_eq!(
        delivered
            .iter()
            .filter(|(k, _)| k == "acme")
            .map(|(_, s)| *s)
            .collect::<Vec<_>>(),
        [1, 3, 3]
    );
}
