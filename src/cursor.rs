//! # Commit-Order-Safe Global Cursor
//!
//! `SELECT ... WHERE global_sequence > ?` is not a safe way to follow the
//! global log. Sequence numbers are reserved before the events are written
//! (see [`crate::sequence`]), so a later number can commit first:
//!
//! ```text
//! seq:      1        2           3
//!           ✓        (writing)   ✓        ◄── naive reader returns 3,
//!                                            moves its cursor past 2,
//!                                            never sees 2
//! ```
//!
//! ## The Watermark
//!
//! The watermark `W` is the highest number such that every number `≤ W` is
//! either stored or provably abandoned. A cursor read returns only events in
//! `(after, W]`, so it never outruns an in-flight predecessor.
//!
//! Computing `W` walks upwards from the last known watermark:
//!
//! 1. Every stored number extends `W`.
//! 2. A missing number `g` below a stored one is probed with
//!    [`AdvisoryLocks::is_held`]. Held: a writer is still on it, stop before
//!    `g`. Not held: re-read the row with a fresh statement. Present means
//!    the writer committed between our scan and the probe. Absent means the
//!    writer rolled back or died, and `g` can never appear.
//! 3. Scanning stops once `limit` events after the cursor are covered.
//!
//! ## Why the Re-Check Is Sound on SQLite
//!
//! In WAL mode every autocommit statement reads the newest committed
//! snapshot. A writer releases its lock only after COMMIT returns, so once a
//! probe sees the lock free, the next statement sees the commit if there was
//! one. The probe is non-blocking and never waits on a writer.
//!
//! ## Guarantees
//!
//! - An event once returned stays below every later watermark.
//! - A consumer starting at 0 and always passing its last seen sequence
//!   receives every committed event exactly once, in sequence order.
//! - If a probe cannot be answered, the read fails with
//!   [`Error::AdvisoryLock`](crate::Error::AdvisoryLock) instead of guessing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::trace;

use crate::advisory::AdvisoryLocks;
use crate::reader::event_from_row;
use crate::schema::{Database, DEFAULT_LOCK_WAIT};
use crate::types::Event;
use crate::Result;

/// Stored sequence numbers fetched per scan query.
const SCAN_BATCH: i64 = 512;

// =============================================================================
// Watermark
// =============================================================================

/// The shared, monotonically increasing watermark.
///
/// # Rust Pattern: Atomic Max
///
/// Several readers may compute watermarks concurrently. `fetch_max` keeps the
/// highest one, so the watermark never moves backwards no matter which reader
/// finishes last.
#[derive(Debug, Default)]
pub struct Watermark(AtomicU64);

impl Watermark {
    /// A watermark before every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Raises the watermark to at least `to`; returns the resulting value.
    pub fn advance(&self, to: u64) -> u64 {
        self.0.fetch_max(to, Ordering::AcqRel).max(to)
    }
}

// =============================================================================
// Read After
// =============================================================================

/// Returns up to `limit` events with `after < global_sequence ≤ W`, oldest
/// first, where `W` is the watermark computed for this call.
///
/// `after` is the last global sequence the caller has seen (0 for none).
///
/// The shared watermark is only raised by scans that started from it: a
/// caller resuming beyond the watermark vouches for its own past, not for
/// everyone's.
pub fn read_after(
    conn: &Connection,
    locks: &dyn AdvisoryLocks,
    watermark: &Watermark,
    after: u64,
    limit: usize,
) -> Result<Vec<Event>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let known = watermark.get();
    let trusted = known >= after;
    let start = known.max(after);

    let limit = limit as u64;
    let mut covered = if start > after {
        count_between(conn, after, start)?
    } else {
        0
    };
    let mut w = start;

    'scan: while covered < limit {
        let batch = stored_above(conn, w)?;
        if batch.is_empty() {
            break;
        }

        for seq in batch {
            for gap in (w + 1)..seq {
                if locks.is_held(gap as i64)? {
                    break 'scan;
                }
                if is_stored(conn, gap)? {
                    covered += 1;
                } else {
                    trace!(sequence = gap, "skipping abandoned sequence number");
                }
                w = gap;
                if covered >= limit {
                    break 'scan;
                }
            }

            w = seq;
            covered += 1;
            if covered >= limit {
                break 'scan;
            }
        }
    }

    let upper = if trusted { watermark.advance(w) } else { w };

    let mut stmt = conn.prepare(
        "SELECT e.global_sequence, e.event_id, e.event_type, e.data, e.metadata,
                e.created_at, e.valid_at, NULL
         FROM events e
         WHERE e.global_sequence > ?1 AND e.global_sequence <= ?2
         ORDER BY e.global_sequence
         LIMIT ?3",
    )?;
    let events = stmt
        .query_map(
            params![after as i64, upper as i64, limit as i64],
            event_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

fn count_between(conn: &Connection, after: u64, upto: u64) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE global_sequence > ?1 AND global_sequence <= ?2",
        params![after as i64, upto as i64],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn stored_above(conn: &Connection, w: u64) -> Result<Vec<u64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT global_sequence FROM events WHERE global_sequence > ?1 ORDER BY global_sequence LIMIT ?2",
    )?;
    let seqs = stmt
        .query_map(params![w as i64, SCAN_BATCH], |row| row.get::<_, i64>(0))?
        .map(|r| r.map(|s| s as u64))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(seqs)
}

fn is_stored(conn: &Connection, seq: u64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM events WHERE global_sequence = ?1",
            [seq as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

// =============================================================================
// Global Cursor
// =============================================================================

/// A global cursor reader owning its connection.
///
/// Cursors that share a watermark (via [`GlobalCursor::with_watermark`])
/// share each other's progress.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ledgerdb::advisory::LockFileLocks;
/// use ledgerdb::GlobalCursor;
///
/// let locks = Arc::new(LockFileLocks::new("events.db.locks")?);
/// let cursor = GlobalCursor::open("events.db", locks)?;
///
/// let mut seen = 0;
/// loop {
///     let page = cursor.read_after(seen, 100)?;
///     let Some(last) = page.last() else { break };
///     seen = last.global_sequence.as_raw();
/// }
/// # Ok::<(), ledgerdb::Error>(())
/// ```
#[derive(Debug)]
pub struct GlobalCursor {
    db: Database,
    locks: Arc<dyn AdvisoryLocks>,
    watermark: Arc<Watermark>,
}

impl GlobalCursor {
    /// Opens an existing database read-only and follows it with a fresh
    /// watermark.
    pub fn open(path: impl AsRef<Path>, locks: Arc<dyn AdvisoryLocks>) -> Result<Self> {
        let db = Database::open_read_only(path, DEFAULT_LOCK_WAIT)?;
        Ok(Self::new(db, locks))
    }

    /// Creates a cursor with a fresh watermark.
    pub fn new(db: Database, locks: Arc<dyn AdvisoryLocks>) -> Self {
        Self::with_watermark(db, locks, Arc::new(Watermark::new()))
    }

    /// Creates a cursor sharing an existing watermark.
    pub fn with_watermark(
        db: Database,
        locks: Arc<dyn AdvisoryLocks>,
        watermark: Arc<Watermark>,
    ) -> Self {
        Self {
            db,
            locks,
            watermark,
        }
    }

    /// See [`read_after`].
    pub fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        read_after(
            self.db.connection(),
            self.locks.as_ref(),
            &self.watermark,
            after,
            limit,
        )
    }

    /// The current shared watermark.
    pub fn watermark(&self) -> u64 {
        self.watermark.get()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::InProcessLocks;
    use crate::clock::ManualClock;
    use crate::repository;
    use crate::advisory::AdvisoryLock;
    use crate::types::{EventData, ExpectedVersion, Stream};
    use crate::Error;

    /// Takes locks normally but cannot tell whether one is held.
    #[derive(Debug, Default)]
    struct UnreachableRegistry(InProcessLocks);

    impl AdvisoryLocks for UnreachableRegistry {
        fn acquire(&self, key: i64) -> Result<AdvisoryLock> {
            self.0.acquire(key)
        }

        fn is_held(&self, key: i64) -> Result<bool> {
            Err(Error::AdvisoryLock {
                key,
                source: std::io::Error::other("unreachable"),
            })
        }
    }

    struct Fixture {
        db: Database,
        locks: InProcessLocks,
        clock: ManualClock,
        watermark: Watermark,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                locks: InProcessLocks::new(),
                clock: ManualClock::new(1_000),
                watermark: Watermark::new(),
            }
        }

        fn publish(&self, event_type: &str) {
            repository::append(
                self.db.connection(),
                &self.locks,
                &self.clock,
                vec![EventData::new(event_type, Vec::new())],
                &Stream::Global,
                ExpectedVersion::Any,
            )
            .unwrap();
        }

        fn poll(&self, after: u64, limit: usize) -> Vec<u64> {
            read_after(self.db.connection(), &self.locks, &self.watermark, after, limit)
                .unwrap()
                .iter()
                .map(|e| e.global_sequence.as_raw())
                .collect()
        }
    }

    #[test]
    fn test_in_flight_predecessor_hides_later_commit() {
        let f = Fixture::new();
        f.publish("A");

        let t1 = repository::begin_append(f.db.connection(), &f.locks, 1).unwrap();
        assert_eq!(t1.first().as_raw(), 2);
        f.publish("C");

        assert_eq!(f.poll(0, 10), vec![1]);
        assert!(f.poll(1, 10).is_empty());
        assert_eq!(f.watermark.get(), 1);

        repository::append_reserved(
            f.db.connection(),
            &f.clock,
            t1,
            vec![EventData::new("B", Vec::new())],
            &Stream::Global,
            ExpectedVersion::Any,
        )
        .unwrap();

        assert_eq!(f.poll(1, 10), vec![2, 3]);
        assert_eq!(f.watermark.get(), 3);
    }

    #[test]
    fn test_rolled_back_reservation_is_skipped() {
        let f = Fixture::new();
        f.publish("A");
        let t1 = repository::begin_append(f.db.connection(), &f.locks, 2).unwrap();
        f.publish("C");

        assert_eq!(f.poll(0, 10), vec![1]);
        assert!(f.poll(1, 10).is_empty());
        t1.rollback();

        assert_eq!(f.poll(1, 10), vec![4]);
        assert_eq!(f.watermark.get(), 4);
    }

    #[test]
    fn test_limit_caps_scan() {
        let f = Fixture::new();
        for _ in 0..5 {
            f.publish("E");
        }

        assert_eq!(f.poll(0, 2), vec![1, 2]);
        assert_eq!(f.watermark.get(), 2);
        assert_eq!(f.poll(2, 2), vec![3, 4]);
        assert_eq!(f.poll(4, 2), vec![5]);
        assert!(f.poll(5, 2).is_empty());
    }

    #[test]
    fn test_rereading_below_watermark() {
        let f = Fixture::new();
        for _ in 0..3 {
            f.publish("E");
        }
        assert_eq!(f.poll(0, 10), vec![1, 2, 3]);
        // A second consumer starting from scratch gets the same events.
        assert_eq!(f.poll(0, 2), vec![1, 2]);
        assert_eq!(f.watermark.get(), 3);
    }

    #[test]
    fn test_resuming_beyond_watermark_does_not_publish() {
        let f = Fixture::new();
        f.publish("A");
        let _open = repository::begin_append(f.db.connection(), &f.locks, 1).unwrap();
        f.publish("C");
        f.publish("D");

        // This caller claims to have seen 3 already; it may read 4...
        assert_eq!(f.poll(3, 10), vec![4]);
        // ...but the shared watermark must not jump over the open reservation.
        assert_eq!(f.watermark.get(), 0);
        assert!(f.poll(1, 10).is_empty());
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let w = Watermark::new();
        assert_eq!(w.advance(5), 5);
        assert_eq!(w.advance(3), 5);
        assert_eq!(w.get(), 5);
    }

    #[test]
    fn test_unanswerable_lock_check_fails_the_read() {
        let f = Fixture::new();
        f.publish("A");
        repository::begin_append(f.db.connection(), &f.locks, 1)
            .unwrap()
            .rollback();
        f.publish("C");

        let err = read_after(f.db.connection(), &UnreachableRegistry::default(), &f.watermark, 0, 10)
            .unwrap_err();
        assert!(matches!(err, Error::AdvisoryLock { key: 2, .. }), "{err}");
        assert_eq!(f.watermark.get(), 0);

        // Reading only up to the first gap needs no lock check.
        let page = read_after(f.db.connection(), &UnreachableRegistry::default(), &f.watermark, 0, 1)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(f.watermark.get(), 1);
    }
}
