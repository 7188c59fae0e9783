#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ledgerdb::advisory::{AdvisoryLocks, LockFileLocks};
use ledgerdb::clock::{Clock, ManualClock};
use ledgerdb::{Database, Event, EventData, GlobalCursor, StoreConfig, StreamRepository};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

/// A lock registry over the database's default lock directory.
///
/// Every call returns a new registry, like a separate process would have.
pub fn file_locks(path: &Path) -> Arc<dyn AdvisoryLocks> {
    let dir = StoreConfig::default().lock_dir_for(path);
    Arc::new(LockFileLocks::new(dir).expect("create lock dir"))
}

pub fn manual_clock() -> ManualClock {
    ManualClock::new(1_700_000_000_000)
}

/// A repository with its own connection and its own lock registry.
pub fn repository(path: &Path, clock: Arc<dyn Clock>) -> StreamRepository {
    StreamRepository::new(
        Database::open(path).expect("open database"),
        file_locks(path),
        clock,
    )
}

pub fn cursor(path: &Path) -> GlobalCursor {
    GlobalCursor::open(path, file_locks(path)).expect("open database")
}

pub fn event(event_type: &str) -> EventData {
    EventData::new(event_type, event_type.as_bytes().to_vec())
}

pub fn sequences(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.global_sequence.as_raw()).collect()
}

pub fn positions(events: &[Event]) -> Vec<Option<u64>> {
    events
        .iter()
        .map(|e| e.position.map(|p| p.as_raw()))
        .collect()
}

pub fn types(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.event_type.clone()).collect()
}

/// Pages through the cursor from the start until an empty page.
pub fn drain(cursor: &GlobalCursor, page_size: usize) -> Vec<u64> {
    let mut seen = Vec::new();
    let mut last = 0;
    loop {
        let page = cursor.read_after(last, page_size).expect("read_after");
        let Some(tail) = page.last() else {
            return seen;
        };
        assert!(page.len() <= page_size);
        last = tail.global_sequence.as_raw();
        seen.extend(sequences(&page));
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
