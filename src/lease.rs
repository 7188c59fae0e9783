//! # Partition Leases
//!
//! A lease gives one worker exclusive processing rights over a partition
//! (a `(format, split_key)` pair) for a limited time.
//!
//! ## State Machine
//!
//! ```text
//!            obtain(w)                       lease expires, obtain(w2)
//!   FREE ─────────────────► HELD(w, t) ─────────────────────────────► HELD(w2, t2)
//!     ▲                      │    ▲                                       │
//!     │     release(w)       │    │ refresh(w)                            │ refresh(w) = Stolen
//!     └──────────────────────┘    └─────                                  ▼
//! ```
//!
//! `locked_at` decides, not `locked_by`: a lease whose holder stopped
//! refreshing for [`DEFAULT_LEASE_DURATION`] counts as free. That keeps
//! partitions live when a worker crashes, at the cost of strict exclusivity.
//! Work done under a lease must be idempotent, and holders should
//! [`refresh`] before each externally visible side effect.
//!
//! ## Outcomes, Not Errors
//!
//! `Taken`, `Stolen` and `NotTakenByThisProcess` are normal answers in a
//! system of competing workers, and so are `LockTimeout` and `Deadlocked`.
//! Each operation returns an outcome enum; only failures that leave the
//! caller unable to reason about the lease come back as [`Error`].
//!
//! ## Row Locking on SQLite
//!
//! Each operation runs in `BEGIN IMMEDIATE`, which takes the database write
//! lock and so stands in for a row lock on the lease. Waiting longer than the
//! connection's busy timeout yields `LockTimeout`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::schema::Database;
use crate::sequence::immediate;
use crate::{Error, Result};

/// How long a lease stays valid without a refresh.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);

// =============================================================================
// Types
// =============================================================================

/// Identifies a partition of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Message format (or any coarse category).
    pub format: String,
    /// Shard within the format.
    pub split_key: String,
}

impl PartitionKey {
    /// Creates a partition key.
    pub fn new(format: impl Into<String>, split_key: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            split_key: split_key.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.format, self.split_key)
    }
}

/// Opaque identifier of a worker process or thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Uses a caller-chosen identifier (e.g. `host:pid`).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The partition this lease guards.
    pub partition: PartitionKey,
    /// Current holder, `None` when free.
    pub locked_by: Option<WorkerId>,
    /// When the holder last obtained or refreshed it (Unix ms).
    pub locked_at: Option<u64>,
}

/// Returns true if the lease is held and its holder obtained or refreshed it
/// less than `duration` ago.
pub fn recently_locked(lease: &Lease, now_ms: u64, duration: Duration) -> bool {
    match (&lease.locked_by, lease.locked_at) {
        (Some(_), Some(locked_at)) => {
            now_ms.saturating_sub(locked_at) < duration.as_millis() as u64
        }
        _ => false,
    }
}

/// Result of [`obtain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObtainOutcome {
    /// The caller now holds the lease.
    Obtained(Lease),
    /// Someone (possibly the caller) holds it and has refreshed recently.
    Taken,
    /// The lease row stayed locked past the wait budget.
    LockTimeout,
    /// The backend aborted the attempt to break a lock cycle.
    Deadlocked,
}

/// Result of [`refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Still held; carries the lease with its new `locked_at`.
    Refreshed(Lease),
    /// Another worker holds it now. Stop processing immediately.
    Stolen,
    /// The lease row stayed locked past the wait budget.
    LockTimeout,
    /// The backend aborted the attempt to break a lock cycle.
    Deadlocked,
}

/// Result of [`release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease is free.
    Released,
    /// The caller does not hold the lease; nothing was changed.
    NotTakenByThisProcess,
    /// The lease row stayed locked past the wait budget.
    LockTimeout,
    /// The backend aborted the attempt to break a lock cycle.
    Deadlocked,
}

/// Contention as an outcome instead of an error.
enum Contended<T> {
    Done(T),
    LockTimeout,
    Deadlocked,
}

fn contended<T>(result: Result<T>) -> Result<Contended<T>> {
    match result {
        Ok(value) => Ok(Contended::Done(value)),
        Err(Error::LockTimeout) => Ok(Contended::LockTimeout),
        Err(Error::Deadlocked) => Ok(Contended::Deadlocked),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Reads a lease row.
pub fn current(conn: &Connection, partition: &PartitionKey) -> Result<Option<Lease>> {
    let row: Option<(Option<String>, Option<i64>)> = conn
        .query_row(
            "SELECT locked_by, locked_at FROM leases WHERE format = ?1 AND split_key = ?2",
            params![partition.format, partition.split_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.map(|(locked_by, locked_at)| Lease {
        partition: partition.clone(),
        locked_by: locked_by.map(WorkerId),
        locked_at: locked_at.map(|t| t as u64),
    }))
}

/// Tries to take the lease for `worker`.
///
/// Succeeds if the lease is free, has never been taken, or its holder's
/// lease has expired. A worker re-obtaining its own live lease gets
/// [`ObtainOutcome::Taken`]; it should [`refresh`] instead.
pub fn obtain(
    conn: &Connection,
    clock: &dyn Clock,
    duration: Duration,
    partition: &PartitionKey,
    worker: &WorkerId,
) -> Result<ObtainOutcome> {
    let outcome = contended(immediate(conn, |conn| {
        let now = clock.now_ms();
        match current(conn, partition)? {
            Some(lease) if recently_locked(&lease, now, duration) => Ok(None),
            Some(_) => {
                conn.execute(
                    "UPDATE leases SET locked_by = ?3, locked_at = ?4
                     WHERE format = ?1 AND split_key = ?2",
                    params![partition.format, partition.split_key, worker.as_str(), now as i64],
                )?;
                Ok(Some(now))
            }
            None => {
                conn.execute(
                    "INSERT INTO leases (format, split_key, locked_by, locked_at) VALUES (?1, ?2, ?3, ?4)",
                    params![partition.format, partition.split_key, worker.as_str(), now as i64],
                )?;
                Ok(Some(now))
            }
        }
    }))?;

    Ok(match outcome {
        Contended::Done(Some(now)) => {
            debug!(partition = %partition, worker = %worker, "obtained lease");
            ObtainOutcome::Obtained(Lease {
                partition: partition.clone(),
                locked_by: Some(worker.clone()),
                locked_at: Some(now),
            })
        }
        Contended::Done(None) => ObtainOutcome::Taken,
        Contended::LockTimeout => ObtainOutcome::LockTimeout,
        Contended::Deadlocked => ObtainOutcome::Deadlocked,
    })
}

/// Extends a held lease.
///
/// Returns [`RefreshOutcome::Stolen`] without changing anything if the lease
/// row no longer names the caller as holder.
pub fn refresh(conn: &Connection, clock: &dyn Clock, lease: &Lease) -> Result<RefreshOutcome> {
    let Some(worker) = &lease.locked_by else {
        return Err(Error::InvalidOperation(format!(
            "lease {} is not held, nothing to refresh",
            lease.partition
        )));
    };

    let outcome = contended(immediate(conn, |conn| {
        let held = current(conn, &lease.partition)?
            .is_some_and(|row| row.locked_by.as_ref() == Some(worker));
        if !held {
            return Ok(None);
        }
        let now = clock.now_ms();
        conn.execute(
            "UPDATE leases SET locked_at = ?3 WHERE format = ?1 AND split_key = ?2",
            params![lease.partition.format, lease.partition.split_key, now as i64],
        )?;
        Ok(Some(now))
    }))?;

    Ok(match outcome {
        Contended::Done(Some(now)) => RefreshOutcome::Refreshed(Lease {
            locked_at: Some(now),
            ..lease.clone()
        }),
        Contended::Done(None) => {
            warn!(partition = %lease.partition, worker = %worker, "lease was stolen");
            RefreshOutcome::Stolen
        }
        Contended::LockTimeout => RefreshOutcome::LockTimeout,
        Contended::Deadlocked => RefreshOutcome::Deadlocked,
    })
}

/// Frees the lease if `worker` holds it.
pub fn release(
    conn: &Connection,
    partition: &PartitionKey,
    worker: &WorkerId,
) -> Result<ReleaseOutcome> {
    let outcome = contended(immediate(conn, |conn| {
        let changed = conn.execute(
            "UPDATE leases SET locked_by = NULL, locked_at = NULL
             WHERE format = ?1 AND split_key = ?2 AND locked_by = ?3",
            params![partition.format, partition.split_key, worker.as_str()],
        )?;
        Ok(changed > 0)
    }))?;

    Ok(match outcome {
        Contended::Done(true) => {
            debug!(partition = %partition, worker = %worker, "released lease");
            ReleaseOutcome::Released
        }
        Contended::Done(false) => ReleaseOutcome::NotTakenByThisProcess,
        Contended::LockTimeout => ReleaseOutcome::LockTimeout,
        Contended::Deadlocked => ReleaseOutcome::Deadlocked,
    })
}

// =============================================================================
// Lease Lock
// =============================================================================

/// Lease operations over an owned connection.
#[derive(Debug)]
pub struct LeaseLock {
    db: Database,
    clock: Arc<dyn Clock>,
    duration: Duration,
}

impl LeaseLock {
    /// Creates a lease lock with [`DEFAULT_LEASE_DURATION`].
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self::with_duration(db, clock, DEFAULT_LEASE_DURATION)
    }

    /// Creates a lease lock with a custom lease duration.
    pub fn with_duration(db: Database, clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self {
            db,
            clock,
            duration,
        }
    }

    /// The lease duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// See [`obtain`].
    pub fn obtain(&self, partition: &PartitionKey, worker: &WorkerId) -> Result<ObtainOutcome> {
        obtain(
            self.db.connection(),
            self.clock.as_ref(),
            self.duration,
            partition,
            worker,
        )
    }

    /// See [`refresh`].
    pub fn refresh(&self, lease: &Lease) -> Result<RefreshOutcome> {
        refresh(self.db.connection(), self.clock.as_ref(), lease)
    }

    /// See [`release`].
    pub fn release(&self, partition: &PartitionKey, worker: &WorkerId) -> Result<ReleaseOutcome> {
        release(self.db.connection(), partition, worker)
    }

    /// See [`current`].
    pub fn current(&self, partition: &PartitionKey) -> Result<Option<Lease>> {
        current(self.db.connection(), partition)
    }

    /// Returns true if the lease is held and fresh right now.
    pub fn is_recently_locked(&self, lease: &Lease) -> bool {
        recently_locked(lease, self.clock.now_ms(), self.duration)
    }
}

// =============================================================================
// Tests
// =============================================================================
