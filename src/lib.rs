//! # LedgerDB - Append-Only Event Store on SQLite
//!
//! LedgerDB stores events in an append-only log and gives you three things
//! on top of it:
//!
//! - **Streams with optimistic concurrency**: append with an expected
//!   version, link existing events into further streams
//! - **A commit-order-safe global cursor**: polling consumers never skip an
//!   event that commits late
//! - **Partition leases**: one worker at a time per `(format, split_key)`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    EventStore (async handle)                    │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │ writer thread                 │ │ reader threads                │
//! │  StreamRepository  LeaseLock  │ │  reads        read_after      │
//! └───────┬───────────────────────┘ └───────┬───────────────┬───────┘
//!         │ reserve: lock first seq         │               │ probe gaps
//!         ▼                                 ▼               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │ SQLite (WAL)                  │ │ advisory locks (lock files)   │
//! └───────────────────────────────┘ └───────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Unique sequences**: every global sequence number is handed out once,
//!    even across processes, and the first number of each append stays locked
//!    until the append commits or rolls back
//! 2. **Dense positions**: named stream positions run 1, 2, 3, ... with no gaps
//! 3. **No overtaking**: the global cursor never returns an event while a
//!    smaller sequence number is still in flight
//! 4. **One holder per lease**: until the lease expires
//!
//! ## Module Organization
//!
//! - [`types`]: Domain types (Stream, EventId, GlobalSequence, ...)
//! - [`schema`]: SQLite DDL and database initialization
//! - [`repository`]: Appends, links and stream maintenance
//! - [`cursor`]: Watermark and `read_after`
//! - [`lease`]: Partition leases
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for LedgerDB operations.
pub mod error;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types for event storage.
///
/// Newtypes for identifiers and positions, plus the request and result types
/// shared by the repository and the async API.
pub mod types;

/// Time sources, injectable for tests.
pub mod clock;

/// Mapping of SQLite failures onto store outcomes.
pub mod classify;

/// Advisory locks keyed by global sequence number.
///
/// The writer holds one while an append is in flight; the cursor probes them
/// to tell an in-flight sequence number from an abandoned one.
pub mod advisory;

/// Global sequence reservation.
pub mod sequence;

/// The stream repository.
///
/// Appends with expected-version checks, links, stream deletion and in-place
/// rewrites. Every write runs in its own `BEGIN IMMEDIATE` transaction.
pub mod repository;

/// Read queries over streams and the global log.
pub mod reader;

/// The commit-order-safe global cursor.
pub mod cursor;

/// Lease-based distributed lock over partitions.
pub mod lease;

/// Store and consumer configuration.
pub mod config;

/// Polling consumer that processes partitions under leases.
pub mod consumer;

/// Dedicated writer thread for the async API.
pub mod writer;

/// Async API for LedgerDB.
///
/// The main entry point is [`EventStore`](api::EventStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::EventStore;
pub use config::{ConsumerConfig, StoreConfig};
pub use consumer::{BatchHandler, Consumer, ConsumerTick, spawn_consumer};
pub use cursor::GlobalCursor;
pub use error::{Error, Result};
pub use lease::{
    Lease, LeaseLock, ObtainOutcome, PartitionKey, RefreshOutcome, ReleaseOutcome, WorkerId,
};
pub use repository::StreamRepository;
pub use schema::Database;

pub use types::{
    AppendResult, Direction, Event, EventData, EventId, ExpectedVersion, GlobalSequence,
    LinkResult, Position, ReadSpec, Stream,
};
