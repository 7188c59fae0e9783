//! # Domain Types for LedgerDB
//!
//! This module defines the core types used throughout LedgerDB: event ids,
//! streams, positions, global sequence numbers and expected versions.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Like any store with two orderings, the easy bug is mixing them up. A
//! [`GlobalSequence`] (store-wide ordinal) and a [`Position`] (per-stream
//! ordinal) are both integers, so each gets its own type:
//!
//! ```rust
//! use ledgerdb::types::{GlobalSequence, Position};
//!
//! fn example(seq: GlobalSequence, pos: Position) {
//!     // seq == pos  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`GlobalSequence`]: reserved monotonically, never reused, never zero.
//!   May become *visible* out of order (see [`crate::cursor`]).
//! - [`Position`]: starts at 0 per ordered stream, no gaps.
//! - [`EventId`]: globally unique; the caller's idempotency key.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

// =============================================================================
// Event Identification
// =============================================================================

/// Globally unique identifier of an event.
///
/// Client-assigned when the caller wants idempotent retries, otherwise
/// generated by [`EventData::new`] as a random (v4) UUID.
///
/// # Storage
///
/// Stored as TEXT in the canonical hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Name reserved for the implicit global stream.
pub const GLOBAL_STREAM: &str = "all";

/// A stream: the implicit global stream or a named, user-defined one.
///
/// # Why an Enum?
///
/// The global stream behaves differently from every named stream: it cannot
/// be linked into or deleted, and it is ordered by [`GlobalSequence`] rather
/// than by [`Position`]. Making it a separate variant lets the repository
/// reject invalid operations with a `match` instead of comparing strings.
///
/// # Example
///
/// ```rust
/// use ledgerdb::types::Stream;
///
/// let orders = Stream::new("order-123");
/// assert!(!orders.is_global());
///
/// // The reserved name maps onto the global stream.
/// assert!(Stream::new("all").is_global());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Every event, exactly once, in write order.
    Global,
    /// A user-defined stream.
    Named(String),
}

impl Stream {
    /// Creates a stream from its name. `"all"` is the global stream.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == GLOBAL_STREAM {
            Stream::Global
        } else {
            Stream::Named(name)
        }
    }

    /// Returns the stream name as stored.
    pub fn name(&self) -> &str {
        match self {
            Stream::Global => GLOBAL_STREAM,
            Stream::Named(name) => name,
        }
    }

    /// Returns true for the global stream.
    pub fn is_global(&self) -> bool {
        matches!(self, Stream::Global)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<&str> for Stream {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Stream {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Positions and Sequences
// =============================================================================

/// A position in the global event log.
///
/// # Invariants
///
/// - Reserved in strictly increasing blocks, never reused
/// - Starts at 1 (zero is the "before everything" cursor)
/// - Numbers of rolled-back appends are skipped, never filled later
///
/// # Rust Pattern: Copy
///
/// `GlobalSequence` is 8 bytes and passed around constantly, so it is `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalSequence(u64);

impl GlobalSequence {
    /// Creates a GlobalSequence from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0.
    pub fn from_raw(value: u64) -> Self {
        assert!(value > 0, "GlobalSequence cannot be zero");
        Self(value)
    }

    /// Creates a GlobalSequence without checking for zero.
    ///
    /// For rows read back from the database, where the primary key is
    /// already known to be positive.
    pub fn from_raw_unchecked(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Adds an offset to this sequence number.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }
}

impl fmt::Display for GlobalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event's ordinal within a named stream.
///
/// Only present for streams written with an ordering expected version
/// (`NoStream`, `Auto`, `Exact`). The first event of a stream is at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    /// Creates a Position from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Expected Version
// =============================================================================

/// Write-time precondition on a stream.
///
/// Supplied per append/link call, resolved once inside the write
/// transaction, never persisted.
///
/// | Variant | Precondition | Positions |
/// |---------|--------------|-----------|
/// | `NoStream` | stream has no entries | from 0 |
/// | `Any` | none | not assigned |
/// | `Auto` | none, continues from the current last position | from last + 1 |
/// | `Exact(n)` | last position is `n` | from n + 1 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    /// The stream must not exist yet.
    NoStream,
    /// No check; entries are stored without positions.
    Any,
    /// Continue from whatever the last position is when the write commits.
    Auto,
    /// The stream's last position must equal this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Returns true when appends with this version carry positions.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, ExpectedVersion::Any)
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::Auto => write!(f, "auto"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event to be appended.
///
/// This is the "input" form. It has an id (so retries are idempotent) but no
/// global sequence or position yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Unique id, generated unless the caller supplies one.
    pub event_id: EventId,

    /// The type of event, e.g. `"OrderPlaced"`.
    pub event_type: String,

    /// Opaque payload. Serialization is the caller's concern.
    pub data: Vec<u8>,

    /// Opaque metadata (correlation ids, causation ids, ...).
    pub metadata: Vec<u8>,

    /// Write time in Unix milliseconds; assigned by the store when absent.
    pub timestamp_ms: Option<u64>,

    /// Business time in Unix milliseconds; defaults to the timestamp.
    pub valid_at_ms: Option<u64>,
}

impl EventData {
    /// Creates an event with a fresh random id.
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::new_random(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
            timestamp_ms: None,
            valid_at_ms: None,
        }
    }

    /// Uses a caller-chosen id (builder pattern).
    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Pins the write timestamp instead of letting the store assign one.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Sets the business time.
    pub fn with_valid_at(mut self, valid_at_ms: u64) -> Self {
        self.valid_at_ms = Some(valid_at_ms);
        self
    }
}

/// A stored event.
///
/// This is the "output" form returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unique id.
    pub event_id: EventId,

    /// Event type.
    pub event_type: String,

    /// Opaque payload.
    pub data: Vec<u8>,

    /// Opaque metadata.
    pub metadata: Vec<u8>,

    /// When the event was stored (Unix milliseconds).
    pub timestamp_ms: u64,

    /// Business time (Unix milliseconds).
    pub valid_at_ms: u64,

    /// Position in the global log.
    pub global_sequence: GlobalSequence,

    /// Position in the stream that was read, if that stream is ordered.
    /// Always `None` for global reads.
    pub position: Option<Position>,
}

// =============================================================================
// Results
// =============================================================================

/// The result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// First global sequence number assigned.
    pub first_sequence: GlobalSequence,

    /// Last global sequence number assigned.
    pub last_sequence: GlobalSequence,

    /// Positions assigned in the target stream, if it is ordered.
    pub positions: Option<(Position, Position)>,

    /// Ids of the stored events, in append order.
    pub event_ids: Vec<EventId>,
}

impl AppendResult {
    /// Returns the number of events that were appended.
    pub fn event_count(&self) -> u64 {
        self.last_sequence.as_raw() - self.first_sequence.as_raw() + 1
    }
}

/// The result of a successful link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkResult {
    /// Positions assigned in the target stream, if it is ordered.
    pub positions: Option<(Position, Position)>,

    /// Number of entries created.
    pub linked: usize,
}

// =============================================================================
// Read Requests
// =============================================================================

/// Read direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

/// What to read, built with a small builder API.
///
/// # Example
///
/// ```rust
/// use ledgerdb::types::{Direction, ReadSpec};
///
/// let spec = ReadSpec::stream("order-1").backward().limit(10);
/// assert_eq!(spec.direction, Direction::Backward);
/// assert_eq!(spec.limit, Some(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSpec {
    /// Stream to read.
    pub stream: Stream,

    /// Read direction.
    pub direction: Direction,

    /// Exclusive start cursor: read strictly after (forward) or before
    /// (backward) this event.
    pub start: Option<EventId>,

    /// Exclusive stop cursor: stop before reaching this event.
    pub stop: Option<EventId>,

    /// Maximum number of events.
    pub limit: Option<usize>,

    /// Only events of these types (empty means all types).
    pub event_types: Vec<String>,
}

impl ReadSpec {
    /// Reads the whole global stream forward.
    pub fn global() -> Self {
        Self::stream(Stream::Global)
    }

    /// Reads a stream forward.
    pub fn stream(stream: impl Into<Stream>) -> Self {
        Self {
            stream: stream.into(),
            direction: Direction::Forward,
            start: None,
            stop: None,
            limit: None,
            event_types: Vec::new(),
        }
    }

    /// Reads newest first.
    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    /// Starts after (or before, backward) the given event.
    pub fn from(mut self, event_id: EventId) -> Self {
        self.start = Some(event_id);
        self
    }

    /// Stops before the given event.
    pub fn to(mut self, event_id: EventId) -> Self {
        self.stop = Some(event_id);
        self
    }

    /// Caps the number of returned events.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filters by event type.
    pub fn of_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_round_trips_through_text() {
        let id = EventId::new_random();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_event_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn test_stream_reserved_name() {
        assert_eq!(Stream::new("all"), Stream::Global);
        assert_eq!(Stream::Global.name(), "all");
        assert_eq!(Stream::new("orders").name(), "orders");
        assert!(!Stream::new("orders").is_global());
    }

    #[test]
    fn test_global_sequence_ordering() {
        let s1 = GlobalSequence::from_raw(1);
        let s2 = GlobalSequence::from_raw(2);
        assert!(s1 < s2);
        assert_eq!(s1.add(1), s2);
    }

    #[test]
    #[should_panic(expected = "GlobalSequence cannot be zero")]
    fn test_global_sequence_zero_panics() {
        GlobalSequence::from_raw(0);
    }

    #[test]
    fn test_expected_version_display() {
        assert_eq!(ExpectedVersion::NoStream.to_string(), "no stream");
        assert_eq!(ExpectedVersion::Any.to_string(), "any");
        assert_eq!(ExpectedVersion::Auto.to_string(), "auto");
        assert_eq!(ExpectedVersion::Exact(3).to_string(), "3");
        assert!(!ExpectedVersion::Any.is_ordered());
        assert!(ExpectedVersion::Exact(0).is_ordered());
    }

    #[test]
    fn test_event_data_builders() {
        let id = EventId::new_random();
        let event = EventData::new("Greeting", b"hello".to_vec())
            .with_id(id)
            .with_metadata(b"meta".to_vec())
            .with_timestamp(10)
            .with_valid_at(5);

        assert_eq!(event.event_id, id);
        assert_eq!(event.event_type, "Greeting");
        assert_eq!(event.metadata, b"meta");
        assert_eq!(event.timestamp_ms, Some(10));
        assert_eq!(event.valid_at_ms, Some(5));
    }

    #[test]
    fn test_fresh_events_get_distinct_ids() {
        let a = EventData::new("A", Vec::new());
        let b = EventData::new("A", Vec::new());
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_append_result_count() {
        let result = AppendResult {
            first_sequence: GlobalSequence::from_raw(100),
            last_sequence: GlobalSequence::from_raw(104),
            positions: None,
            event_ids: Vec::new(),
        };
        assert_eq!(result.event_count(), 5);
    }

    #[test]
    fn test_read_spec_builder() {
        let id = EventId::new_random();
        let spec = ReadSpec::global().from(id).limit(3).of_type("A").of_type("B");
        assert!(spec.stream.is_global());
        assert_eq!(spec.start, Some(id));
        assert_eq!(spec.limit, Some(3));
        assert_eq!(spec.event_types, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(spec.direction, Direction::Forward);
    }
}
