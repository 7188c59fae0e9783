//! # Global Sequence Reservation
//!
//! Appends take their global sequence numbers from a counter row in a short
//! transaction of their own, *before* the events are inserted. Two writers
//! therefore hold disjoint, increasing blocks and insert in parallel (from
//! different connections or processes), and the later block may commit first.
//!
//! ```text
//! writer A: reserve [10..12] ───────────── insert 10..12 ── COMMIT
//! writer B:        reserve [13] ─ insert 13 ─ COMMIT
//! reader:                                     sees 13, not 10..12  ◄── gap
//! ```
//!
//! The advisory lock on the block's first number is what lets the cursor
//! tell that gap apart from one left by a rolled-back append. It is acquired
//! inside the reservation transaction, so it is held before any other
//! connection can learn that the numbers exist.

use rusqlite::{params, Connection};
use tracing::warn;

use crate::advisory::{AdvisoryLock, AdvisoryLocks};
use crate::classify::contention;
use crate::schema::GLOBAL_SEQUENCE_NAME;
use crate::types::GlobalSequence;
use crate::{Error, Result};

/// A reserved block of global sequence numbers.
///
/// Holds the advisory lock for the block; dropping the reservation (after the
/// event transaction commits or rolls back) releases it. Numbers of a dropped,
/// unused reservation are never handed out again.
#[derive(Debug)]
pub struct Reservation {
    first: GlobalSequence,
    count: u64,
    _lock: AdvisoryLock,
}

impl Reservation {
    /// First reserved number.
    pub fn first(&self) -> GlobalSequence {
        self.first
    }

    /// Last reserved number.
    pub fn last(&self) -> GlobalSequence {
        self.first.add(self.count - 1)
    }

    /// Number of reserved numbers.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Iterates over the reserved numbers in order.
    pub fn sequences(&self) -> impl Iterator<Item = GlobalSequence> + '_ {
        (0..self.count).map(move |offset| self.first.add(offset))
    }
}

/// Reserves `count` consecutive global sequence numbers and locks the first.
///
/// # Errors
///
/// - [`Error::InvalidOperation`] for `count == 0`
/// - [`Error::LockTimeout`] / [`Error::Deadlocked`] on write-lock contention
/// - [`Error::AdvisoryLock`] if the lock cannot be taken
pub fn reserve(conn: &Connection, locks: &dyn AdvisoryLocks, count: u64) -> Result<Reservation> {
    if count == 0 {
        return Err(Error::InvalidOperation(
            "cannot reserve zero sequence numbers".to_string(),
        ));
    }

    immediate(conn, |conn| {
        let next: i64 = conn.query_row(
            "SELECT next_value FROM sequences WHERE name = ?1",
            [GLOBAL_SEQUENCE_NAME],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE sequences SET next_value = next_value + ?2 WHERE name = ?1",
            params![GLOBAL_SEQUENCE_NAME, count as i64],
        )?;

        let lock = locks.acquire(next)?;
        Ok(Reservation {
            first: GlobalSequence::from_raw(next as u64),
            count,
            _lock: lock,
        })
    })
}

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// Commits when `f` succeeds, rolls back otherwise. `BEGIN IMMEDIATE` takes
/// SQLite's write lock up front, so the busy timeout applies once, at the
/// start, and contention surfaces as [`Error::LockTimeout`].
pub(crate) fn immediate<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute("BEGIN IMMEDIATE", []).map_err(contention)?;

    match f(conn) {
        Ok(value) => match conn.execute("COMMIT", []) {
            Ok(_) => Ok(value),
            Err(e) => {
                rollback(conn);
                Err(contention(e))
            }
        },
        Err(e) => {
            rollback(conn);
            Err(e)
        }
    }
}

/// Rolls back the open transaction, if any.
///
/// A failed ROLLBACK leaves the connection inside the transaction, and the
/// next `BEGIN IMMEDIATE` on it fails; the original error is still the one
/// returned.
fn rollback(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute("ROLLBACK", []) {
        warn!(error = %e, "rollback failed, connection left inside a transaction");
    }
}
