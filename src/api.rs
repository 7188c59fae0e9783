//! # Async API for LedgerDB
//!
//! [`EventStore`] is the async entry point. It wraps the synchronous
//! repository, cursor and lease code with Tokio channels so async
//! applications never block on SQLite.
//!
//! ## The SQLite Challenge
//!
//! `rusqlite::Connection` is `!Sync`, so it cannot be shared across tasks
//! even behind an `Arc`. Instead, connections live on dedicated threads:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                            │
//! │   task1 ─┐                                    ┌─ task4      │
//! │   task2 ─┼── WriteRequest (mpsc) ─┐  ┌─ ReadRequest (mpsc) ─┼─ task5
//! │   task3 ─┘                        │  │        └─ task6      │
//! └───────────────────────────────────┼──┼──────────────────────┘
//!                                     ▼  ▼
//!                      ┌──────────────────┐  ┌────────────────────────┐
//!                      │  writer thread   │  │  reader threads (N)    │
//!                      │  repository      │  │  read-only connections │
//!                      │  leases          │  │  shared watermark      │
//!                      └──────────────────┘  └────────────────────────┘
//! ```
//!
//! ## Cross-Process Use
//!
//! Several `EventStore`s, in one process or many, may open the same file.
//! They coordinate through SQLite's write lock and through advisory lock
//! files in [`StoreConfig::lock_dir`], which must be the same for all of
//! them. Each store has its own watermark; watermarks only ever describe
//! committed state, so they never need to agree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::advisory::{AdvisoryLocks, LockFileLocks};
use crate::clock::{Clock, MonotonicClock};
use crate::config::StoreConfig;
use crate::cursor::Watermark;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseLock, ObtainOutcome, PartitionKey, RefreshOutcome, ReleaseOutcome, WorkerId};
use crate::reader::{self, CursorContext, ReadRequest};
use crate::repository::StreamRepository;
use crate::schema::Database;
use crate::types::{
    AppendResult, Event, EventData, EventId, ExpectedVersion, GlobalSequence, LinkResult,
    Position, ReadSpec, Stream,
};
use crate::writer::{spawn_writer, WriterHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

// =============================================================================
// EventStore - The Main Async Handle
// =============================================================================

/// The main async handle for LedgerDB operations.
///
/// # Thread Safety
///
/// `EventStore` is `Clone`, `Send` and `Sync`. All clones share the same
/// writer thread, reader pool and watermark.
///
/// # Example
///
/// ```rust,no_run
/// use ledgerdb::{EventData, EventStore, ExpectedVersion, Stream};
///
/// # async fn example() -> ledgerdb::Result<()> {
/// let store = EventStore::open("events.db").await?;
///
/// store
///     .append(
///         vec![EventData::new("OrderPlaced", b"{}".to_vec())],
///         Stream::new("order-1"),
///         ExpectedVersion::NoStream,
///     )
///     .await?;
///
/// let page = store.read_after(0, 100).await?;
/// assert_eq!(page.len(), 1);
///
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventStore {
    writer: WriterHandle,
    read_tx: mpsc::Sender<ReadRequest>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    reader_count: usize,
    watermark: Arc<Watermark>,
    path: PathBuf,
}

impl EventStore {
    /// Opens (or creates) a store with the default configuration.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default()).await
    }

    /// Opens a store with an explicit configuration.
    ///
    /// Advisory locks are lock files in [`StoreConfig::lock_dir_for`].
    pub async fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let locks = Arc::new(LockFileLocks::new(config.lock_dir_for(&path))?);
        Self::open_with_parts(path, config, locks, Arc::new(MonotonicClock::new())).await
    }

    /// Opens a store with injected advisory locks and clock.
    ///
    /// # When to Use
    ///
    /// Tests that want a [`ManualClock`](crate::clock::ManualClock), or
    /// single-process deployments that prefer
    /// [`InProcessLocks`](crate::advisory::InProcessLocks).
    pub async fn open_with_parts(
        path: impl AsRef<Path>,
        config: StoreConfig,
        locks: Arc<dyn AdvisoryLocks>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Schema first: readers open read-only and expect the tables.
        let repo = StreamRepository::new(
            Database::open_with_lock_wait(&path, config.lock_wait)?,
            Arc::clone(&locks),
            Arc::clone(&clock),
        );
        let leases = LeaseLock::with_duration(
            Database::open_with_lock_wait(&path, config.lock_wait)?,
            clock,
            config.lease_duration,
        );
        let (writer, writer_thread) = spawn_writer(repo, leases)?;

        let reader_count = config
            .reader_threads
            .unwrap_or_else(|| available_parallelism().map(|n| n.get()).unwrap_or(MIN_READ_THREADS))
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(Mutex::new(read_rx));
        let watermark = Arc::new(Watermark::new());

        let mut threads = Vec::with_capacity(reader_count + 1);
        threads.push(writer_thread);

        for i in 0..reader_count {
            let conn = Database::open_read_only(&path, config.lock_wait)?.into_connection();
            let cursor = CursorContext {
                locks: Arc::clone(&locks),
                watermark: Arc::clone(&watermark),
            };
            let rx = Arc::clone(&read_rx);
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|source| Error::Spawn {
                    name: "reader",
                    source,
                })?;

            let handle = thread::Builder::new()
                .name(format!("ledgerdb-reader-{i}"))
                .spawn(move || rt.block_on(reader::run_reader_pooled(conn, cursor, rx)))
                .map_err(|source| Error::Spawn {
                    name: "reader",
                    source,
                })?;
            threads.push(handle);
        }

        debug!(path = %path.display(), readers = reader_count, "opened event store");

        Ok(Self {
            writer,
            read_tx,
            threads: Arc::new(Mutex::new(threads)),
            reader_count,
            watermark,
            path,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value of this store's global watermark.
    pub fn watermark(&self) -> u64 {
        self.watermark.get()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends events to a stream. See [`crate::repository::append`].
    pub async fn append(
        &self,
        events: Vec<EventData>,
        stream: Stream,
        expected: ExpectedVersion,
    ) -> Result<AppendResult> {
        self.writer.append(events, stream, expected).await
    }

    /// Links stored events into a stream. See [`crate::repository::link`].
    pub async fn link(
        &self,
        event_ids: Vec<EventId>,
        stream: Stream,
        expected: ExpectedVersion,
    ) -> Result<LinkResult> {
        self.writer.link(event_ids, stream, expected).await
    }

    /// Removes a named stream's entries.
    pub async fn delete_stream(&self, stream: Stream) -> Result<usize> {
        self.writer.delete_stream(stream).await
    }

    /// Rewrites stored events in place.
    pub async fn update_messages(&self, events: Vec<EventData>) -> Result<()> {
        self.writer.update_messages(events).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    async fn read_request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.read_tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Shutdown("reader pool"))?;
        response_rx.await.map_err(|_| Error::Shutdown("reader pool"))?
    }

    /// Reads a page of a stream. See [`crate::reader::read`].
    pub async fn read(&self, spec: ReadSpec) -> Result<Vec<Event>> {
        self.read_request(|response| ReadRequest::Read { spec, response })
            .await
    }

    /// Counts the events a read would return.
    pub async fn count(&self, spec: ReadSpec) -> Result<u64> {
        self.read_request(|response| ReadRequest::Count { spec, response })
            .await
    }

    /// Reads the global log after `after`, never past an in-flight append.
    /// See [`crate::cursor::read_after`].
    pub async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        self.read_request(|response| ReadRequest::ReadAfter {
            after,
            limit,
            response,
        })
        .await
    }

    /// Returns true if the event is stored.
    pub async fn has_event(&self, event_id: EventId) -> Result<bool> {
        self.read_request(|response| ReadRequest::HasEvent { event_id, response })
            .await
    }

    /// Newest event of a stream.
    pub async fn last_stream_event(&self, stream: Stream) -> Result<Option<Event>> {
        self.read_request(|response| ReadRequest::LastStreamEvent { stream, response })
            .await
    }

    /// Named streams the event is linked into.
    pub async fn streams_of(&self, event_id: EventId) -> Result<Vec<Stream>> {
        self.read_request(|response| ReadRequest::StreamsOf { event_id, response })
            .await
    }

    /// Position of an event within a named stream.
    pub async fn position_in_stream(
        &self,
        event_id: EventId,
        stream: Stream,
    ) -> Result<Option<Position>> {
        self.read_request(|response| ReadRequest::PositionInStream {
            event_id,
            stream,
            response,
        })
        .await
    }

    /// Global sequence of an event.
    pub async fn global_position(&self, event_id: EventId) -> Result<GlobalSequence> {
        self.read_request(|response| ReadRequest::GlobalPosition { event_id, response })
            .await
    }

    /// Returns true if the event is part of the stream.
    pub async fn event_in_stream(&self, event_id: EventId, stream: Stream) -> Result<bool> {
        self.read_request(|response| ReadRequest::EventInStream {
            event_id,
            stream,
            response,
        })
        .await
    }

    // =========================================================================
    // Leases
    // =========================================================================

    /// Takes a partition lease. See [`crate::lease::obtain`].
    pub async fn obtain_lease(
        &self,
        partition: PartitionKey,
        worker: WorkerId,
    ) -> Result<ObtainOutcome> {
        self.writer.obtain_lease(partition, worker).await
    }

    /// Extends a partition lease. See [`crate::lease::refresh`].
    pub async fn refresh_lease(&self, lease: Lease) -> Result<RefreshOutcome> {
        self.writer.refresh_lease(lease).await
    }

    /// Frees a partition lease. See [`crate::lease::release`].
    pub async fn release_lease(
        &self,
        partition: PartitionKey,
        worker: WorkerId,
    ) -> Result<ReleaseOutcome> {
        self.writer.release_lease(partition, worker).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Shuts the store down.
    ///
    /// Readers and the writer finish the requests already queued, then their
    /// threads exit and connections close. Every clone of this handle fails
    /// with [`Error::Shutdown`] afterwards.
    pub async fn shutdown(self) {
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }
        self.writer.shutdown().await;

        let threads = std::mem::take(&mut *self.threads.lock().await);
        for handle in threads {
            if handle.join().is_err() {
                warn!(path = %self.path.display(), "store thread panicked before shutdown");
            }
        }
        debug!(path = %self.path.display(), "event store shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
