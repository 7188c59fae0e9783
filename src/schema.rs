//! # SQLite Schema for LedgerDB
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  events                        stream_entries                           │
//! │  ┌─────────────────────┐       ┌──────────────────────┐                 │
//! │  │ global_sequence (PK)│       │ id (PK, autoinc)     │                 │
//! │  │ event_id (UNIQUE) ◄─┼───────│ event_id             │                 │
//! │  │ event_type          │       │ stream               │                 │
//! │  │ data / metadata     │       │ position (nullable)  │                 │
//! │  │ created_at/valid_at │       │ created_at           │                 │
//! │  └─────────────────────┘       └──────────────────────┘                 │
//! │                                                                         │
//! │  sequences                     leases                                   │
//! │  ┌─────────────────┐           ┌──────────────────────┐                 │
//! │  │ name (PK)       │           │ format, split_key(PK)│                 │
//! │  │ next_value      │           │ locked_by, locked_at │                 │
//! │  └─────────────────┘           └──────────────────────┘                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### The global stream has no entry rows
//!
//! Every event belongs to the global stream exactly once, in
//! `global_sequence` order. The `events` row *is* that membership, so the
//! global stream costs no extra insert and can never be deleted or linked.
//!
//! ### Why a `sequences` table instead of AUTOINCREMENT?
//!
//! Sequence numbers are reserved in a short transaction of their own, before
//! the events are inserted (see [`crate::sequence`]). That is what allows
//! events to become visible out of order, and what the global cursor has to
//! defend against.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::sequence::immediate;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Name of the counter row used for global sequence reservation.
pub(crate) const GLOBAL_SEQUENCE_NAME: &str = "global";

/// How long a connection waits for SQLite's write lock when none is configured.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// Immutable event payloads, keyed by their reserved global sequence.
///
/// # Columns
///
/// - `global_sequence`: reserved number, unique, never reused (PK)
/// - `event_id`: caller's idempotency key, unique across the store
/// - `created_at` / `valid_at`: Unix milliseconds
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    global_sequence INTEGER PRIMARY KEY,
    event_id        TEXT NOT NULL UNIQUE,
    event_type      TEXT NOT NULL,
    data            BLOB NOT NULL,
    metadata        BLOB NOT NULL,
    created_at      INTEGER NOT NULL,
    valid_at        INTEGER NOT NULL
)
"#;

/// Membership of events in named streams.
///
/// `position` is NULL for streams written with `ExpectedVersion::Any`.
/// `id` is the stream's read order and the paging cursor for named streams.
const CREATE_STREAM_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS stream_entries (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    stream     TEXT NOT NULL,
    position   INTEGER,
    event_id   TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Optimistic concurrency: two writers cannot claim the same position.
///
/// NULL positions never collide, which is what `Any` relies on.
const CREATE_STREAM_POSITION_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS stream_entries_position
ON stream_entries(stream, position)
"#;

/// An event appears at most once per stream.
const CREATE_STREAM_EVENT_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS stream_entries_event
ON stream_entries(stream, event_id)
"#;

/// Reverse lookup for `streams_of(event_id)`.
const CREATE_ENTRY_EVENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS stream_entries_by_event
ON stream_entries(event_id)
"#;

/// Reservation counters. One row, `global`, holds the next unreserved
/// global sequence number.
const CREATE_SEQUENCES: &str = r#"
CREATE TABLE IF NOT EXISTS sequences (
    name       TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL
)
"#;

/// Partition leases. Rows are created on first obtain and never deleted;
/// releasing clears `locked_by`/`locked_at`.
const CREATE_LEASES: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    format    TEXT NOT NULL,
    split_key TEXT NOT NULL,
    locked_by TEXT,
    locked_at INTEGER,
    PRIMARY KEY (format, split_key)
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS ledgerdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the LedgerDB schema applied.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Wrapping `Connection` means a `Database` is always initialized: you
/// cannot get one without the tables, pragmas and busy timeout in place.
///
/// # Ownership
///
/// `Database` owns its `Connection`. Each component that writes
/// (repository, lease lock, cursor) owns its own `Database`, which is how
/// several of them contend for the write lock from one process.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// Uses [`DEFAULT_LOCK_WAIT`] as the busy timeout.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ledgerdb::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_lock_wait(path, DEFAULT_LOCK_WAIT)
    }

    /// Opens a database file with an explicit write-lock wait budget.
    ///
    /// Once `lock_wait` elapses, a blocked write fails with `SQLITE_BUSY`,
    /// which the write paths report as `LockTimeout`. Opening an initialized
    /// database does not write, so it never waits; first-time setup does, and
    /// reports contention the same way.
    pub fn open_with_lock_wait(path: impl AsRef<Path>, lock_wait: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(lock_wait)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Opens an existing database for reading only.
    ///
    /// The schema is not touched. Used by the reader pool.
    pub fn open_read_only(path: impl AsRef<Path>, lock_wait: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(lock_wait)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Note
    ///
    /// An in-memory database is private to its connection: only one
    /// component can use it. Concurrency tests use files.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // =====================================================================
        // SQLite Pragmas
        // =====================================================================

        // WAL: readers see the last committed snapshot while a writer is
        // active, and every autocommit statement starts a fresh snapshot.
        // The cursor's gap re-check depends on the second property.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        // =====================================================================
        // Schema Setup
        // =====================================================================

        // An up-to-date database is only read here, so opening one never
        // waits on an active writer.
        if let Some(version) = stored_version(&self.conn)? {
            check_version(&version)?;
            if sequence_is_current(&self.conn)? {
                return Ok(());
            }
        }

        immediate(&self.conn, |conn| {
            conn.execute_batch(CREATE_METADATA)?;
            conn.execute_batch(CREATE_EVENTS)?;
            conn.execute_batch(CREATE_STREAM_ENTRIES)?;
            conn.execute_batch(CREATE_STREAM_POSITION_INDEX)?;
            conn.execute_batch(CREATE_STREAM_EVENT_INDEX)?;
            conn.execute_batch(CREATE_ENTRY_EVENT_INDEX)?;
            conn.execute_batch(CREATE_SEQUENCES)?;
            conn.execute_batch(CREATE_LEASES)?;

            // Another connection may have finished setup while we waited.
            match stored_version(conn)? {
                Some(version) => check_version(&version)?,
                None => {
                    conn.execute(
                        "INSERT INTO ledgerdb_metadata (key, value) VALUES ('schema_version', ?1)",
                        [SCHEMA_VERSION.to_string()],
                    )?;
                }
            }
            seed_sequence(conn)
        })
    }

    /// Returns the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Setup Helpers
// =============================================================================

fn stored_version(conn: &Connection) -> Result<Option<String>> {
    let has_metadata: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'ledgerdb_metadata'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_metadata.is_none() {
        return Ok(None);
    }

    Ok(conn
        .query_row(
            "SELECT value FROM ledgerdb_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn check_version(version: &str) -> Result<()> {
    if version == SCHEMA_VERSION.to_string() {
        return Ok(());
    }
    Err(Error::Schema(format!(
        "schema version mismatch: database has version {version}, but this LedgerDB version requires {SCHEMA_VERSION}"
    )))
}

/// True when the reservation counter exists and sits above every stored
/// event.
fn sequence_is_current(conn: &Connection) -> Result<bool> {
    let current: Option<bool> = conn
        .query_row(
            "SELECT next_value > (SELECT COALESCE(MAX(global_sequence), 0) FROM events)
             FROM sequences WHERE name = ?1",
            [GLOBAL_SEQUENCE_NAME],
            |row| row.get(0),
        )
        .optional()?;
    Ok(current.unwrap_or(false))
}

/// Makes sure the reservation counter exists and sits above every stored
/// event, so a restored or hand-edited database never hands out a number
/// twice.
fn seed_sequence(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sequences (name, next_value) VALUES (?1, 1)",
        [GLOBAL_SEQUENCE_NAME],
    )?;
    conn.execute(
        "UPDATE sequences
         SET next_value = max(next_value, (SELECT COALESCE(MAX(global_sequence), 0) + 1 FROM events))
         WHERE name = ?1",
        [GLOBAL_SEQUENCE_NAME],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        // metadata, events, stream_entries, sequences, leases
        assert_eq!(table_count(db.connection()), 5);
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");

        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");

            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };

        assert!(indexes.contains(&"stream_entries_position".to_string()));
        assert!(indexes.contains(&"stream_entries_event".to_string()));
    }

    #[test]
    fn test_sequence_seeded_at_one() {
        let db = Database::open_in_memory().expect("should create db");
        let next: i64 = db
            .conn
            .query_row(
                "SELECT next_value FROM sequences WHERE name = 'global'",
                [],
                |row| row.get(0),
            )
            .expect("should query sequence");
        assert_eq!(next, 1);
    }

    #[test]
    fn test_reopen_advances_sequence_past_stored_events() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "INSERT INTO events VALUES (41, 'x', 'T', x'', x'', 0, 0)",
                    [],
                )
                .expect("should insert");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(db.connection()), 5);
        let next: i64 = db
            .conn
            .query_row(
                "SELECT next_value FROM sequences WHERE name = 'global'",
                [],
                |row| row.get(0),
            )
            .expect("should query sequence");
        assert_eq!(next, 42);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE ledgerdb_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update");
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_open_does_not_wait_on_active_writer() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");
        drop(Database::open(&path).expect("first open should work"));

        let writer = Connection::open(&path).expect("should open writer");
        writer.execute_batch("BEGIN IMMEDIATE").expect("should take write lock");

        let db = Database::open_with_lock_wait(&path, Duration::from_millis(50))
            .expect("open should not need the write lock");
        assert_eq!(table_count(db.connection()), 5);
        Database::open_read_only(&path, Duration::from_millis(50))
            .expect("read-only open should work");
    }

    #[test]
    fn test_stale_counter_repair_reports_lock_timeout() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute("INSERT INTO events VALUES (7, 'x', 'T', x'', x'', 0, 0)", [])
                .expect("should insert");
        }

        let writer = Connection::open(&path).expect("should open writer");
        writer.execute_batch("BEGIN IMMEDIATE").expect("should take write lock");

        let err = Database::open_with_lock_wait(&path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout), "{err}");

        writer.execute_batch("ROLLBACK").expect("should roll back");
        let db = Database::open_with_lock_wait(&path, Duration::from_millis(50))
            .expect("open should repair the counter");
        let next: i64 = db
            .conn
            .query_row("SELECT next_value FROM sequences WHERE name = 'global'", [], |row| row.get(0))
            .expect("should query sequence");
        assert_eq!(next, 8);
    }
}
