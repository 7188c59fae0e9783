//! # Error Handling for LedgerDB
//!
//! This module defines the error types used throughout LedgerDB. A single
//! error enum ([`Error`]) covers every failure an event-store operation can
//! report, so callers branch with `match` instead of string matching.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]` attributes
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Precondition | `WrongExpectedVersion`, `DuplicatedInStream`, `EventNotFound`, `InvalidOperation` | Re-read, fix the request |
//! | Contention | `LockTimeout`, `Deadlocked` | Retry with backoff |
//! | Integrity | `AdvisoryLock`, `Sqlite`, `Schema` | Propagate, investigate |
//! | Lifecycle | `Spawn`, `Shutdown` | Stop using the handle |
//!
//! Lease operations do not use this enum for their expected outcomes
//! (`Taken`, `Stolen`, ...). Those are ordinary results and live in
//! [`crate::lease`]. Only hard failures reach [`Error`] from there.

use thiserror::Error;

use crate::types::{EventId, ExpectedVersion};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in LedgerDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use ledgerdb::Error;
///
/// match repo.append(events, &stream, ExpectedVersion::Exact(4)) {
///     Ok(result) => println!("stored at {}", result.last_sequence),
///     Err(Error::WrongExpectedVersion { .. }) => reload_and_retry(),
///     Err(e) if e.is_transient() => backoff_and_retry(),
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Precondition Violations (never retried automatically)
    // =========================================================================

    /// Optimistic concurrency conflict on a named stream.
    ///
    /// Raised when the stream's last position does not match the expected
    /// version, or when the `(stream, position)` / `(stream, event_id)`
    /// uniqueness constraints reject the insert.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream
    /// 2. Re-apply business logic
    /// 3. Retry with the new expected version
    #[error("wrong expected version for stream '{stream}': expected {expected}")]
    WrongExpectedVersion {
        /// The stream where the conflict occurred.
        stream: String,
        /// The version the caller expected.
        expected: ExpectedVersion,
    },

    /// An event with this id is already stored.
    ///
    /// Event ids are the caller's idempotency key: a retry after a timeout
    /// that actually committed lands here.
    #[error("event {event_id} is already stored (appending to '{stream}')")]
    DuplicatedInStream {
        /// The id that collided.
        event_id: EventId,
        /// The stream the failed append targeted.
        stream: String,
    },

    /// An operation referenced an event id that is not stored.
    #[error("event {event_id} not found")]
    EventNotFound {
        /// The missing event id.
        event_id: EventId,
    },

    /// The request is malformed regardless of database state
    /// (e.g. linking into the global stream, an empty stream name).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // =========================================================================
    // Transient Contention (safe to retry)
    // =========================================================================

    /// The write lock could not be acquired within the configured wait budget.
    #[error("lock wait timeout exceeded")]
    LockTimeout,

    /// The backend refused the transaction to break a lock cycle
    /// (in SQLite: a stale read snapshot that cannot be upgraded).
    #[error("deadlock detected")]
    Deadlocked,

    // =========================================================================
    // Integrity / Connectivity Failures
    // =========================================================================

    /// The advisory-lock primitive could not answer.
    ///
    /// The global cursor never guesses: if it cannot prove that a missing
    /// sequence number was abandoned, the read fails with this error.
    #[error("advisory lock failure on key {key}: {source}")]
    AdvisoryLock {
        /// The lock key (a global sequence number).
        key: i64,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, which lets
    /// `?` convert rusqlite errors automatically. Contention and uniqueness
    /// failures are translated by [`crate::classify`] before they get here.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corrupted rows.
    #[error("schema error: {0}")]
    Schema(String),

    /// A background thread or its runtime could not be started.
    #[error("failed to start {name} thread: {source}")]
    Spawn {
        /// Which thread.
        name: &'static str,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A background thread (writer, reader pool, consumer) has stopped.
    #[error("{0} has shut down")]
    Shutdown(&'static str),
}

impl Error {
    /// Returns true for contention outcomes that are safe to retry.
    ///
    /// The store never retries internally; callers decide whether the state
    /// they acted on is still current.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockTimeout | Error::Deadlocked)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
