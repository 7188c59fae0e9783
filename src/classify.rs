//! # Backend Failure Classification
//!
//! SQLite reports contention and constraint violations as generic
//! `rusqlite::Error::SqliteFailure` values. Every write path funnels its
//! errors through [`classify`], so the mapping from "what SQLite said" to
//! "what the caller should do" lives in exactly one place.
//!
//! ## Mapping
//!
//! | SQLite result | Classification |
//! |---------------|----------------|
//! | `SQLITE_BUSY_SNAPSHOT` (517) | [`BackendFailure::Deadlocked`] |
//! | `SQLITE_LOCKED` | [`BackendFailure::Deadlocked`] |
//! | other `SQLITE_BUSY` | [`BackendFailure::LockTimeout`] |
//! | `UNIQUE constraint failed: events.event_id` | [`BackendFailure::DuplicateEvent`] |
//! | `UNIQUE constraint failed: stream_entries.stream, ...` | [`BackendFailure::StreamConflict`] |
//!
//! `SQLITE_BUSY_SNAPSHOT` means a transaction read from a snapshot that a
//! concurrent writer already superseded. Waiting cannot fix it, which is
//! the same resolution a deadlock detector gives: abort and retry.

use rusqlite::ErrorCode;

use crate::Error;

/// Extended result code for a stale WAL read snapshot.
const SQLITE_BUSY_SNAPSHOT: i32 = 517;

/// What a backend error means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFailure {
    /// `events.event_id` uniqueness violated.
    DuplicateEvent,
    /// A `(stream, position)` or `(stream, event_id)` uniqueness violation.
    StreamConflict,
    /// The busy-timeout budget ran out waiting for the write lock.
    LockTimeout,
    /// The transaction can never acquire its lock and must be restarted.
    Deadlocked,
    /// Anything else; propagated unchanged.
    Other,
}

/// Classifies a rusqlite error.
pub fn classify(err: &rusqlite::Error) -> BackendFailure {
    let rusqlite::Error::SqliteFailure(code, message) = err else {
        return BackendFailure::Other;
    };

    match code.code {
        ErrorCode::DatabaseBusy if code.extended_code == SQLITE_BUSY_SNAPSHOT => {
            BackendFailure::Deadlocked
        }
        ErrorCode::DatabaseLocked => BackendFailure::Deadlocked,
        ErrorCode::DatabaseBusy => BackendFailure::LockTimeout,
        ErrorCode::ConstraintViolation => {
            let message = message.as_deref().unwrap_or_default();
            if message.contains("events.event_id") {
                BackendFailure::DuplicateEvent
            } else if message.contains("stream_entries.stream") {
                BackendFailure::StreamConflict
            } else {
                BackendFailure::Other
            }
        }
        _ => BackendFailure::Other,
    }
}

/// Converts a rusqlite error into [`Error`], translating contention.
///
/// Uniqueness violations stay [`Error::Sqlite`]; only the write paths know
/// which stream and event they concern.
pub(crate) fn contention(err: rusqlite::Error) -> Error {
    match classify(&err) {
        BackendFailure::LockTimeout => Error::LockTimeout,
        BackendFailure::Deadlocked => Error::Deadlocked,
        _ => Error::Sqlite(err),
    }
}
