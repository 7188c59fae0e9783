//! # Event Reader
//!
//! Read operations for LedgerDB, written as free functions over a
//! `&Connection` so they run unchanged on the writer's connection, on a
//! pooled read-only connection, or in a unit test's in-memory database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   Read-only SQLite                               │
//! │                    connections                                   │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! ## Query Shape
//!
//! A page of N events is one JOIN of `stream_entries` and `events` (named
//! streams) or one scan of `events` (global stream), plus at most two
//! lookups that turn the `start`/`stop` event ids into cursor values.
//! The number of queries never depends on N.
//!
//! Cursor values are `stream_entries.id` for named streams and
//! `global_sequence` for the global stream.

use std::sync::Arc;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::advisory::AdvisoryLocks;
use crate::cursor::{self, Watermark};
use crate::error::Result;
use crate::types::{
    Direction, Event, EventId, GlobalSequence, Position, ReadSpec, Stream,
};
use crate::Error;

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    /// Read a page of a stream.
    Read {
        spec: ReadSpec,
        response: oneshot::Sender<Result<Vec<Event>>>,
    },
    /// Count the events a read would return.
    Count {
        spec: ReadSpec,
        response: oneshot::Sender<Result<u64>>,
    },
    /// Read the global log after a cursor, up to the watermark.
    ReadAfter {
        after: u64,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Event>>>,
    },
    /// Is this event stored?
    HasEvent {
        event_id: EventId,
        response: oneshot::Sender<Result<bool>>,
    },
    /// Newest event of a stream.
    LastStreamEvent {
        stream: Stream,
        response: oneshot::Sender<Result<Option<Event>>>,
    },
    /// Named streams an event is linked into.
    StreamsOf {
        event_id: EventId,
        response: oneshot::Sender<Result<Vec<Stream>>>,
    },
    /// Position of an event within a stream.
    PositionInStream {
        event_id: EventId,
        stream: Stream,
        response: oneshot::Sender<Result<Option<Position>>>,
    },
    /// Global sequence of an event.
    GlobalPosition {
        event_id: EventId,
        response: oneshot::Sender<Result<GlobalSequence>>,
    },
    /// Is this event part of that stream?
    EventInStream {
        event_id: EventId,
        stream: Stream,
        response: oneshot::Sender<Result<bool>>,
    },
    /// Shutdown the reader.
    Shutdown,
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Columns selected by every event query, in this order, followed by the
/// stream position (or NULL).
const EVENT_COLUMNS: &str =
    "e.global_sequence, e.event_id, e.event_type, e.data, e.metadata, e.created_at, e.valid_at";

pub(crate) fn event_id_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<EventId> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let global_sequence: i64 = row.get(0)?;
    let created_at: i64 = row.get(5)?;
    let valid_at: i64 = row.get(6)?;
    let position: Option<i64> = row.get(7)?;

    Ok(Event {
        event_id: event_id_at(row, 1)?,
        event_type: row.get(2)?,
        data: row.get(3)?,
        metadata: row.get(4)?,
        timestamp_ms: created_at as u64,
        valid_at_ms: valid_at as u64,
        global_sequence: GlobalSequence::from_raw_unchecked(global_sequence as u64),
        position: position.map(|p| Position::from_raw(p as u64)),
    })
}

// =============================================================================
// Query Building
// =============================================================================

/// The FROM/WHERE part of a read, shared by `read` and `count`.
struct Plan {
    from: &'static str,
    order_column: &'static str,
    conditions: Vec<String>,
    values: Vec<Value>,
}

fn plan(conn: &Connection, spec: &ReadSpec) -> Result<Plan> {
    let mut plan = match &spec.stream {
        Stream::Global => Plan {
            from: "events e",
            order_column: "e.global_sequence",
            conditions: Vec::new(),
            values: Vec::new(),
        },
        Stream::Named(name) => Plan {
            from: "stream_entries se JOIN events e ON e.event_id = se.event_id",
            order_column: "se.id",
            conditions: vec!["se.stream = ?".to_string()],
            values: vec![Value::Text(name.clone())],
        },
    };

    let (after, before) = match spec.direction {
        Direction::Forward => (">", "<"),
        Direction::Backward => ("<", ">"),
    };

    if let Some(start) = &spec.start {
        let value = cursor_value(conn, &spec.stream, start)?;
        plan.conditions.push(format!("{} {after} ?", plan.order_column));
        plan.values.push(Value::Integer(value));
    }
    if let Some(stop) = &spec.stop {
        let value = cursor_value(conn, &spec.stream, stop)?;
        plan.conditions.push(format!("{} {before} ?", plan.order_column));
        plan.values.push(Value::Integer(value));
    }
    if !spec.event_types.is_empty() {
        let placeholders = vec!["?"; spec.event_types.len()].join(", ");
        plan.conditions.push(format!("e.event_type IN ({placeholders})"));
        plan.values
            .extend(spec.event_types.iter().cloned().map(Value::Text));
    }

    Ok(plan)
}

impl Plan {
    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// Turns an event id into the ordering value of `stream`.
fn cursor_value(conn: &Connection, stream: &Stream, event_id: &EventId) -> Result<i64> {
    let found = match stream {
        Stream::Global => conn
            .query_row(
                "SELECT global_sequence FROM events WHERE event_id = ?1",
                [event_id.to_string()],
                |row| row.get(0),
            )
            .optional()?,
        Stream::Named(name) => conn
            .query_row(
                "SELECT id FROM stream_entries WHERE stream = ?1 AND event_id = ?2",
                params![name, event_id.to_string()],
                |row| row.get(0),
            )
            .optional()?,
    };
    found.ok_or(Error::EventNotFound {
        event_id: *event_id,
    })
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Reads a page of events.
///
/// # Ordering
///
/// Named streams come back in entry order, which is position order for
/// ordered streams. The global stream comes back in `global_sequence` order.
/// Global reads carry no positions.
///
/// # Errors
///
/// [`Error::EventNotFound`] when `start` or `stop` is not part of the stream.
///
/// # Note
///
/// This is a raw read of the global table. It may show an event whose
/// predecessor is still being written; consumers that must not skip use
/// [`crate::cursor`].
pub fn read(conn: &Connection, spec: &ReadSpec) -> Result<Vec<Event>> {
    let plan = plan(conn, spec)?;
    let position = if spec.stream.is_global() {
        "NULL"
    } else {
        "se.position"
    };
    let order = match spec.direction {
        Direction::Forward => "ASC",
        Direction::Backward => "DESC",
    };
    let limit = spec.limit.map(|l| l as i64).unwrap_or(-1);

    let sql = format!(
        "SELECT {EVENT_COLUMNS}, {position} FROM {}{} ORDER BY {} {order} LIMIT {limit}",
        plan.from,
        plan.where_clause(),
        plan.order_column,
    );

    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map(params_from_iter(plan.values.iter()), event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Counts the events [`read`] would return for the same spec.
pub fn count(conn: &Connection, spec: &ReadSpec) -> Result<u64> {
    let plan = plan(conn, spec)?;
    let sql = format!("SELECT COUNT(*) FROM {}{}", plan.from, plan.where_clause());
    let total: i64 = conn.query_row(&sql, params_from_iter(plan.values.iter()), |row| row.get(0))?;
    let total = total as u64;
    Ok(match spec.limit {
        Some(limit) => total.min(limit as u64),
        None => total,
    })
}

/// Returns true if an event with this id is stored.
pub fn has_event(conn: &Connection, event_id: &EventId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM events WHERE event_id = ?1",
            [event_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Returns the newest event of a stream, if it has any.
pub fn last_stream_event(conn: &Connection, stream: &Stream) -> Result<Option<Event>> {
    let spec = ReadSpec::stream(stream.clone()).backward().limit(1);
    Ok(read(conn, &spec)?.into_iter().next())
}

/// Returns the named streams an event is linked into, oldest link first.
///
/// The global stream is not listed: every event belongs to it.
pub fn streams_of(conn: &Connection, event_id: &EventId) -> Result<Vec<Stream>> {
    let mut stmt =
        conn.prepare("SELECT stream FROM stream_entries WHERE event_id = ?1 ORDER BY id")?;
    let streams = stmt
        .query_map([event_id.to_string()], |row| row.get::<_, String>(0))?
        .map(|name| name.map(Stream::Named))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(streams)
}

/// Returns an event's position within a named stream.
///
/// `Ok(None)` means the event is in the stream without a position (it was
/// written with `ExpectedVersion::Any`).
///
/// # Errors
///
/// - [`Error::EventNotFound`] if the event is not in the stream
/// - [`Error::InvalidOperation`] for the global stream, which has no positions
pub fn position_in_stream(
    conn: &Connection,
    event_id: &EventId,
    stream: &Stream,
) -> Result<Option<Position>> {
    let Stream::Named(name) = stream else {
        return Err(Error::InvalidOperation(
            "the global stream has no positions; use global_position".to_string(),
        ));
    };

    let found: Option<Option<i64>> = conn
        .query_row(
            "SELECT position FROM stream_entries WHERE stream = ?1 AND event_id = ?2",
            params![name, event_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match found {
        Some(position) => Ok(position.map(|p| Position::from_raw(p as u64))),
        None => Err(Error::EventNotFound {
            event_id: *event_id,
        }),
    }
}

/// Returns an event's global sequence number.
pub fn global_position(conn: &Connection, event_id: &EventId) -> Result<GlobalSequence> {
    let raw = cursor_value(conn, &Stream::Global, event_id)?;
    Ok(GlobalSequence::from_raw_unchecked(raw as u64))
}

/// Returns true if the event is part of the stream.
pub fn event_in_stream(conn: &Connection, event_id: &EventId, stream: &Stream) -> Result<bool> {
    match cursor_value(conn, stream, event_id) {
        Ok(_) => Ok(true),
        Err(Error::EventNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Reader Loop
// =============================================================================

/// State shared by every reader thread for global cursor reads.
#[derive(Debug, Clone)]
pub struct CursorContext {
    pub locks: Arc<dyn AdvisoryLocks>,
    pub watermark: Arc<Watermark>,
}

/// Pooled reader loop.
///
/// Multiple threads share the channel via `Arc<Mutex>`. Each thread has its
/// own read-only SQLite connection, so they execute queries in parallel.
/// Whichever thread is free picks up the next request.
pub async fn run_reader_pooled(
    conn: Connection,
    cursor: CursorContext,
    rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        match request {
            Some(ReadRequest::Read { spec, response }) => {
                let _ = response.send(read(&conn, &spec));
            }
            Some(ReadRequest::Count { spec, response }) => {
                let _ = response.send(count(&conn, &spec));
            }
            Some(ReadRequest::ReadAfter {
                after,
                limit,
                response,
            }) => {
                let result = cursor::read_after(
                    &conn,
                    cursor.locks.as_ref(),
                    &cursor.watermark,
                    after,
                    limit,
                );
                let _ = response.send(result);
            }
            Some(ReadRequest::HasEvent { event_id, response }) => {
                let _ = response.send(has_event(&conn, &event_id));
            }
            Some(ReadRequest::LastStreamEvent { stream, response }) => {
                let _ = response.send(last_stream_event(&conn, &stream));
            }
            Some(ReadRequest::StreamsOf { event_id, response }) => {
                let _ = response.send(streams_of(&conn, &event_id));
            }
            Some(ReadRequest::PositionInStream {
                event_id,
                stream,
                response,
            }) => {
                let _ = response.send(position_in_stream(&conn, &event_id, &stream));
            }
            Some(ReadRequest::GlobalPosition { event_id, response }) => {
                let _ = response.send(global_position(&conn, &event_id));
            }
            Some(ReadRequest::EventInStream {
                event_id,
                stream,
                response,
            }) => {
                let _ = response.send(event_in_stream(&conn, &event_id, &stream));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    /// Inserts an event row and optionally a stream entry, bypassing the
    /// repository so reads are tested on their own.
    fn insert(conn: &Connection, seq: i64, event_type: &str, entry: Option<(&str, Option<i64>)>) -> EventId {
        let id = EventId::new_random();
        conn.execute(
            "INSERT INTO events VALUES (?1, ?2, ?3, ?4, x'', 100, 100)",
            params![seq, id.to_string(), event_type, format!("payload-{seq}").into_bytes()],
        )
        .unwrap();
        if let Some((stream, position)) = entry {
            conn.execute(
                "INSERT INTO stream_entries (stream, position, event_id, created_at) VALUES (?1, ?2, ?3, 100)",
                params![stream, position, id.to_string()],
            )
            .unwrap();
        }
        id
    }

    fn setup() -> (Database, Vec<EventId>) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let ids = vec![
            insert(conn, 1, "Opened", Some(("acct", Some(0)))),
            insert(conn, 2, "Other", None),
            insert(conn, 3, "Deposited", Some(("acct", Some(1)))),
            insert(conn, 4, "Deposited", Some(("acct", Some(2)))),
        ];
        (db, ids)
    }

    fn sequences(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.global_sequence.as_raw()).collect()
    }

    #[test]
    fn test_read_named_stream_forward_and_backward() {
        let (db, _) = setup();
        let conn = db.connection();

        let forward = read(conn, &ReadSpec::stream("acct")).unwrap();
        assert_eq!(sequences(&forward), vec![1, 3, 4]);
        assert_eq!(
            forward.iter().map(|e| e.position.unwrap().as_raw()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(forward[0].data, b"payload-1");

        let backward = read(conn, &ReadSpec::stream("acct").backward()).unwrap();
        assert_eq!(sequences(&backward), vec![4, 3, 1]);
    }

    #[test]
    fn test_read_global_has_no_positions() {
        let (db, _) = setup();
        let events = read(db.connection(), &ReadSpec::global()).unwrap();
        assert_eq!(sequences(&events), vec![1, 2, 3, 4]);
        assert!(events.iter().all(|e| e.position.is_none()));
    }

    #[test]
    fn test_read_with_cursors_and_limit() {
        let (db, ids) = setup();
        let conn = db.connection();

        let page = read(conn, &ReadSpec::global().from(ids[0]).limit(2)).unwrap();
        assert_eq!(sequences(&page), vec![2, 3]);

        let before = read(conn, &ReadSpec::global().backward().from(ids[3])).unwrap();
        assert_eq!(sequences(&before), vec![3, 2, 1]);

        let between = read(conn, &ReadSpec::stream("acct").from(ids[0]).to(ids[3])).unwrap();
        assert_eq!(sequences(&between), vec![3]);
    }

    #[test]
    fn test_read_unknown_cursor_is_not_found() {
        let (db, ids) = setup();
        // ids[1] is stored but not linked into "acct".
        let err = read(db.connection(), &ReadSpec::stream("acct").from(ids[1])).unwrap_err();
        assert!(matches!(err, Error::EventNotFound { event_id } if event_id == ids[1]));
    }

    #[test]
    fn test_read_filters_by_type() {
        let (db, _) = setup();
        let conn = db.connection();

        let deposits = read(conn, &ReadSpec::global().of_type("Deposited")).unwrap();
        assert_eq!(sequences(&deposits), vec![3, 4]);
        assert_eq!(count(conn, &ReadSpec::global().of_type("Deposited")).unwrap(), 2);
        assert_eq!(count(conn, &ReadSpec::stream("acct").limit(2)).unwrap(), 2);
        assert_eq!(count(conn, &ReadSpec::stream("missing")).unwrap(), 0);
    }

    #[test]
    fn test_lookups() {
        let (db, ids) = setup();
        let conn = db.connection();
        let acct = Stream::new("acct");

        assert!(has_event(conn, &ids[1]).unwrap());
        assert!(!has_event(conn, &EventId::new_random()).unwrap());

        let last = last_stream_event(conn, &acct).unwrap().unwrap();
        assert_eq!(last.event_id, ids[3]);
        assert!(last_stream_event(conn, &Stream::new("missing")).unwrap().is_none());

        assert_eq!(streams_of(conn, &ids[0]).unwrap(), vec![acct.clone()]);
        assert!(streams_of(conn, &ids[1]).unwrap().is_empty());

        assert_eq!(
            position_in_stream(conn, &ids[2], &acct).unwrap(),
            Some(Position::from_raw(1))
        );
        assert!(matches!(
            position_in_stream(conn, &ids[1], &acct),
            Err(Error::EventNotFound { .. })
        ));

        assert_eq!(global_position(conn, &ids[2]).unwrap().as_raw(), 3);
        assert!(event_in_stream(conn, &ids[1], &Stream::Global).unwrap());
        assert!(!event_in_stream(conn, &ids[1], &acct).unwrap());
    }
}
