//! # Stream Repository
//!
//! Writes into the event log: append with an expected version, link existing
//! events into further streams, delete a stream's entries, and rewrite event
//! payloads in place.
//!
//! ## Two-Phase Append
//!
//! ```text
//! begin_append(n)                 append_reserved(pending, events, ...)
//! ┌───────────────────────────┐   ┌──────────────────────────────────────┐
//! │ BEGIN IMMEDIATE           │   │ BEGIN IMMEDIATE                      │
//! │   reserve n sequences     │   │   resolve expected version           │
//! │   lock first sequence     │   │   INSERT events (reserved sequences) │
//! │ COMMIT                    │   │   INSERT stream_entries              │
//! └───────────────────────────┘   │ COMMIT / ROLLBACK                    │
//!                                 └──────────────────────────────────────┘
//!                                   then release the advisory lock
//! ```
//!
//! [`append`] runs both phases back to back. The split form exists for
//! callers that need to hold a reservation open while doing other work,
//! which is also how tests stage out-of-order commits.
//!
//! ## Expected Version Resolution
//!
//! Resolution happens inside the insert transaction, so it is atomic with the
//! insert. `BEGIN IMMEDIATE` already serializes writers; the unique indexes on
//! `(stream, position)` and `(stream, event_id)` back that up, and any
//! violation they report surfaces as [`Error::WrongExpectedVersion`].
//!
//! ## Error Translation
//!
//! Every SQLite error from an insert goes through [`classify`], which is the
//! only place that looks at SQLite error codes and messages.

use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use crate::advisory::AdvisoryLocks;
use crate::classify::{classify, BackendFailure};
use crate::clock::Clock;
use crate::reader;
use crate::schema::Database;
use crate::sequence::{self, immediate, Reservation};
use crate::types::{
    AppendResult, Event, EventData, EventId, ExpectedVersion, GlobalSequence, LinkResult,
    Position, ReadSpec, Stream,
};
use crate::{Error, Result};

// =============================================================================
// Pending Appends
// =============================================================================

/// Global sequence numbers reserved for an append that has not been written.
///
/// While a `PendingAppend` exists, global cursor reads stop before its
/// numbers. Dropping it (or calling [`PendingAppend::rollback`]) abandons the
/// numbers for good.
#[derive(Debug)]
pub struct PendingAppend {
    reservation: Reservation,
}

impl PendingAppend {
    /// First reserved global sequence.
    pub fn first(&self) -> GlobalSequence {
        self.reservation.first()
    }

    /// Number of events this append must carry.
    pub fn count(&self) -> u64 {
        self.reservation.count()
    }

    /// Abandons the reservation.
    pub fn rollback(self) {
        debug!(
            first = self.first().as_raw(),
            count = self.count(),
            "abandoning reserved sequence numbers"
        );
    }
}

/// Reserves global sequence numbers for `count` events.
pub fn begin_append(
    conn: &Connection,
    locks: &dyn AdvisoryLocks,
    count: u64,
) -> Result<PendingAppend> {
    let reservation = sequence::reserve(conn, locks, count)?;
    Ok(PendingAppend { reservation })
}

// =============================================================================
// Append
// =============================================================================

/// Appends events to a stream.
///
/// # Errors
///
/// - [`Error::WrongExpectedVersion`] if the stream's state does not match
/// - [`Error::DuplicatedInStream`] if an event id is already stored
/// - [`Error::InvalidOperation`] for an empty batch, an empty stream name, or
///   an ordered append to the global stream
/// - [`Error::LockTimeout`] / [`Error::Deadlocked`] on contention
///
/// # Example
///
/// ```rust
/// use ledgerdb::advisory::InProcessLocks;
/// use ledgerdb::clock::SystemClock;
/// use ledgerdb::repository;
/// use ledgerdb::{Database, EventData, ExpectedVersion, Stream};
///
/// let db = Database::open_in_memory()?;
/// let locks = InProcessLocks::new();
/// let result = repository::append(
///     db.connection(),
///     &locks,
///     &SystemClock,
///     vec![EventData::new("OrderPlaced", b"{}".to_vec())],
///     &Stream::new("order-1"),
///     ExpectedVersion::NoStream,
/// )?;
/// assert_eq!(result.first_sequence.as_raw(), 1);
/// # Ok::<(), ledgerdb::Error>(())
/// ```
pub fn append(
    conn: &Connection,
    locks: &dyn AdvisoryLocks,
    clock: &dyn Clock,
    events: Vec<EventData>,
    stream: &Stream,
    expected: ExpectedVersion,
) -> Result<AppendResult> {
    validate_append_target(stream, expected)?;
    if events.is_empty() {
        return Err(Error::InvalidOperation("no events to append".to_string()));
    }
    let pending = begin_append(conn, locks, events.len() as u64)?;
    append_reserved(conn, clock, pending, events, stream, expected)
}

/// Writes events into sequence numbers reserved by [`begin_append`].
///
/// The reservation is released when this returns, whether the write
/// committed or not.
pub fn append_reserved(
    conn: &Connection,
    clock: &dyn Clock,
    pending: PendingAppend,
    events: Vec<EventData>,
    stream: &Stream,
    expected: ExpectedVersion,
) -> Result<AppendResult> {
    validate_append_target(stream, expected)?;
    if events.len() as u64 != pending.count() {
        return Err(Error::InvalidOperation(format!(
            "{} sequence numbers were reserved but {} events were given",
            pending.count(),
            events.len()
        )));
    }

    let PendingAppend { reservation } = pending;
    let stream_name = stream.name().to_string();

    let result = immediate(conn, |conn| {
        let start = resolve_version(conn, stream, expected)?;
        let now = clock.now_ms();

        let mut event_ids = Vec::with_capacity(events.len());
        for (offset, (event, seq)) in events.iter().zip(reservation.sequences()).enumerate() {
            let created_at = event.timestamp_ms.unwrap_or(now);
            let valid_at = event.valid_at_ms.unwrap_or(created_at);
            conn.execute(
                "INSERT INTO events (global_sequence, event_id, event_type, data, metadata, created_at, valid_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    seq.as_raw() as i64,
                    event.event_id.to_string(),
                    event.event_type,
                    event.data,
                    event.metadata,
                    created_at as i64,
                    valid_at as i64,
                ],
            )
            .map_err(|e| write_failure(e, stream, expected, event.event_id))?;

            if let Stream::Named(name) = stream {
                let position = start.map(|s| s + offset as i64);
                insert_entry(conn, name, position, &event.event_id, now)
                    .map_err(|e| write_failure(e, stream, expected, event.event_id))?;
            }
            event_ids.push(event.event_id);
        }

        Ok(AppendResult {
            first_sequence: reservation.first(),
            last_sequence: reservation.last(),
            positions: positions(start, events.len()),
            event_ids,
        })
    });

    match &result {
        Ok(r) => debug!(
            stream = %stream_name,
            first = r.first_sequence.as_raw(),
            last = r.last_sequence.as_raw(),
            "appended events"
        ),
        Err(e) => debug!(stream = %stream_name, error = %e, "append failed"),
    }

    drop(reservation);
    result
}

fn validate_append_target(stream: &Stream, expected: ExpectedVersion) -> Result<()> {
    match stream {
        Stream::Global if expected.is_ordered() => Err(Error::InvalidOperation(
            format!("the global stream only accepts ExpectedVersion::Any, got {expected}"),
        )),
        Stream::Named(name) if name.is_empty() => {
            Err(Error::InvalidOperation("stream name must not be empty".to_string()))
        }
        _ => Ok(()),
    }
}

/// Resolves an expected version to the position of the first new entry.
///
/// `None` means the entries carry no positions.
fn resolve_version(
    conn: &Connection,
    stream: &Stream,
    expected: ExpectedVersion,
) -> Result<Option<i64>> {
    let Stream::Named(name) = stream else {
        return Ok(None);
    };
    let conflict = || Error::WrongExpectedVersion {
        stream: name.clone(),
        expected,
    };

    match expected {
        ExpectedVersion::Any => Ok(None),
        ExpectedVersion::Auto => Ok(Some(last_position(conn, name)?.map_or(0, |p| p + 1))),
        ExpectedVersion::NoStream => {
            let entries: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                [name],
                |row| row.get(0),
            )?;
            if entries > 0 {
                return Err(conflict());
            }
            Ok(Some(0))
        }
        ExpectedVersion::Exact(n) => match last_position(conn, name)? {
            Some(last) if last == n as i64 => Ok(Some(last + 1)),
            _ => Err(conflict()),
        },
    }
}

fn last_position(conn: &Connection, stream: &str) -> Result<Option<i64>> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(position) FROM stream_entries WHERE stream = ?1",
        [stream],
        |row| row.get(0),
    )?;
    Ok(last)
}

fn insert_entry(
    conn: &Connection,
    stream: &str,
    position: Option<i64>,
    event_id: &EventId,
    now: u64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO stream_entries (stream, position, event_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![stream, position, event_id.to_string(), now as i64],
    )
}

fn positions(start: Option<i64>, count: usize) -> Option<(Position, Position)> {
    start.map(|s| {
        (
            Position::from_raw(s as u64),
            Position::from_raw((s + count as i64 - 1) as u64),
        )
    })
}

/// Translates an insert failure into the caller-facing error.
fn write_failure(
    err: rusqlite::Error,
    stream: &Stream,
    expected: ExpectedVersion,
    event_id: EventId,
) -> Error {
    match classify(&err) {
        BackendFailure::DuplicateEvent => Error::DuplicatedInStream {
            event_id,
            stream: stream.name().to_string(),
        },
        BackendFailure::StreamConflict => Error::WrongExpectedVersion {
            stream: stream.name().to_string(),
            expected,
        },
        BackendFailure::LockTimeout => Error::LockTimeout,
        BackendFailure::Deadlocked => Error::Deadlocked,
        BackendFailure::Other => Error::Sqlite(err),
    }
}

// =============================================================================
// Link
// =============================================================================

/// Links already-stored events into a named stream.
///
/// # Errors
///
/// - [`Error::EventNotFound`] for the first id that is not stored, checked
///   before the insert transaction
/// - [`Error::DuplicatedInStream`] if an event is already in the stream
/// - [`Error::WrongExpectedVersion`] as for [`append`]
/// - [`Error::InvalidOperation`] for the global stream or an empty id list
pub fn link(
    conn: &Connection,
    clock: &dyn Clock,
    event_ids: &[EventId],
    stream: &Stream,
    expected: ExpectedVersion,
) -> Result<LinkResult> {
    let Stream::Named(name) = stream else {
        return Err(Error::InvalidOperation(
            "events cannot be linked into the global stream".to_string(),
        ));
    };
    validate_append_target(stream, expected)?;
    if event_ids.is_empty() {
        return Err(Error::InvalidOperation("no events to link".to_string()));
    }

    let stored = stored_ids(conn, event_ids)?;
    if let Some(missing) = event_ids.iter().find(|id| !stored.contains(id)) {
        return Err(Error::EventNotFound {
            event_id: *missing,
        });
    }
    for id in event_ids {
        if reader::event_in_stream(conn, id, stream)? {
            return Err(Error::DuplicatedInStream {
                event_id: *id,
                stream: name.clone(),
            });
        }
    }

    let result = immediate(conn, |conn| {
        let start = resolve_version(conn, stream, expected)?;
        let now = clock.now_ms();
        for (offset, id) in event_ids.iter().enumerate() {
            let position = start.map(|s| s + offset as i64);
            insert_entry(conn, name, position, id, now)
                .map_err(|e| write_failure(e, stream, expected, *id))?;
        }
        Ok(LinkResult {
            positions: positions(start, event_ids.len()),
            linked: event_ids.len(),
        })
    })?;

    debug!(stream = %name, linked = result.linked, "linked events");
    Ok(result)
}

/// Returns which of `ids` are stored, with one query.
fn stored_ids(conn: &Connection, ids: &[EventId]) -> Result<Vec<EventId>> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT event_id FROM events WHERE event_id IN ({placeholders})");
    let values: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();

    let mut stmt = conn.prepare(&sql)?;
    let stored = stmt
        .query_map(params_from_iter(values.iter()), |row| reader::event_id_at(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stored)
}

// =============================================================================
// Delete and Update
// =============================================================================

/// Removes a named stream's entries. Events and their global membership stay.
///
/// Returns the number of removed entries. Deleting a stream that has no
/// entries is not an error.
pub fn delete_stream(conn: &Connection, stream: &Stream) -> Result<usize> {
    let Stream::Named(name) = stream else {
        return Err(Error::InvalidOperation(
            "the global stream cannot be deleted".to_string(),
        ));
    };

    let removed = immediate(conn, |conn| {
        Ok(conn.execute("DELETE FROM stream_entries WHERE stream = ?1", [name])?)
    })?;
    debug!(stream = %name, removed, "deleted stream");
    Ok(removed)
}

/// Rewrites type, payload, metadata and (if given) business time of stored
/// events. Ids, sequence numbers, stream membership and creation time are
/// untouched. All or nothing.
pub fn update_messages(conn: &Connection, events: &[EventData]) -> Result<()> {
    immediate(conn, |conn| {
        for event in events {
            let changed = conn.execute(
                "UPDATE events
                 SET event_type = ?2, data = ?3, metadata = ?4, valid_at = COALESCE(?5, valid_at)
                 WHERE event_id = ?1",
                params![
                    event.event_id.to_string(),
                    event.event_type,
                    event.data,
                    event.metadata,
                    event.valid_at_ms.map(|v| v as i64),
                ],
            )?;
            if changed == 0 {
                return Err(Error::EventNotFound {
                    event_id: event.event_id,
                });
            }
        }
        Ok(())
    })?;
    debug!(updated = events.len(), "updated events in place");
    Ok(())
}

// =============================================================================
// Repository
// =============================================================================

/// A stream repository owning its connection.
///
/// Thin wrapper over this module's functions and [`crate::reader`]; each
/// instance is one writer. Several instances (in one or many processes) can
/// share a database file as long as they share the advisory lock registry.
#[derive(Debug)]
pub struct StreamRepository {
    db: Database,
    locks: Arc<dyn AdvisoryLocks>,
    clock: Arc<dyn Clock>,
}

impl StreamRepository {
    /// Creates a repository from its collaborators.
    pub fn new(db: Database, locks: Arc<dyn AdvisoryLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { db, locks, clock }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        self.db.connection()
    }

    /// See [`append`].
    pub fn append(
        &self,
        events: Vec<EventData>,
        stream: &Stream,
        expected: ExpectedVersion,
    ) -> Result<AppendResult> {
        append(
            self.db.connection(),
            self.locks.as_ref(),
            self.clock.as_ref(),
            events,
            stream,
            expected,
        )
    }

    /// See [`begin_append`].
    pub fn begin_append(&self, count: u64) -> Result<PendingAppend> {
        begin_append(self.db.connection(), self.locks.as_ref(), count)
    }

    /// See [`append_reserved`].
    pub fn append_reserved(
        &self,
        pending: PendingAppend,
        events: Vec<EventData>,
        stream: &Stream,
        expected: ExpectedVersion,
    ) -> Result<AppendResult> {
        append_reserved(
            self.db.connection(),
            self.clock.as_ref(),
            pending,
            events,
            stream,
            expected,
        )
    }

    /// See [`link`].
    pub fn link(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected: ExpectedVersion,
    ) -> Result<LinkResult> {
        link(self.db.connection(), self.clock.as_ref(), event_ids, stream, expected)
    }

    /// See [`delete_stream`].
    pub fn delete_stream(&self, stream: &Stream) -> Result<usize> {
        delete_stream(self.db.connection(), stream)
    }

    /// See [`update_messages`].
    pub fn update_messages(&self, events: &[EventData]) -> Result<()> {
        update_messages(self.db.connection(), events)
    }

    /// See [`reader::read`].
    pub fn read(&self, spec: &ReadSpec) -> Result<Vec<Event>> {
        reader::read(self.db.connection(), spec)
    }

    /// See [`reader::count`].
    pub fn count(&self, spec: &ReadSpec) -> Result<u64> {
        reader::count(self.db.connection(), spec)
    }

    /// See [`reader::has_event`].
    pub fn has_event(&self, event_id: &EventId) -> Result<bool> {
        reader::has_event(self.db.connection(), event_id)
    }

    /// See [`reader::last_stream_event`].
    pub fn last_stream_event(&self, stream: &Stream) -> Result<Option<Event>> {
        reader::last_stream_event(self.db.connection(), stream)
    }

    /// See [`reader::streams_of`].
    pub fn streams_of(&self, event_id: &EventId) -> Result<Vec<Stream>> {
        reader::streams_of(self.db.connection(), event_id)
    }

    /// See [`reader::position_in_stream`].
    pub fn position_in_stream(&self, event_id: &EventId, stream: &Stream) -> Result<Option<Position>> {
        reader::position_in_stream(self.db.connection(), event_id, stream)
    }

    /// See [`reader::global_position`].
    pub fn global_position(&self, event_id: &EventId) -> Result<GlobalSequence> {
        reader::global_position(self.db.connection(), event_id)
    }

    /// See [`reader::event_in_stream`].
    pub fn event_in_stream(&self, event_id: &EventId, stream: &Stream) -> Result<bool> {
        reader::event_in_stream(self.db.connection(), event_id, stream)
    }

    /// Returns the last position of an ordered stream, if it has one.
    pub fn last_position(&self, stream: &Stream) -> Result<Option<Position>> {
        match stream {
            Stream::Global => Ok(None),
            Stream::Named(name) => Ok(last_position(self.db.connection(), name)?
                .map(|p| Position::from_raw(p as u64))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
