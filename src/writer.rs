//! # Writer Thread
//!
//! All writes of an [`EventStore`](crate::EventStore) run on one dedicated
//! thread that owns the write connections. Async callers talk to it through
//! a channel and get their answer back on a oneshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  WriteRequest   ┌────────────────────────────────┐
//! │ WriterHandle│ ──────────────► │ writer thread                  │
//! │ (Clone)     │    (mpsc)       │  StreamRepository (connection) │
//! └─────────────┘ ◄────────────── │  LeaseLock        (connection) │
//!                   oneshot       └────────────────────────────────┘
//! ```
//!
//! ## Why a Dedicated Thread?
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, and every call blocks.
//! Owning the connections on one thread keeps blocking SQLite calls off the
//! caller's async runtime and needs no locking around the connection.
//!
//! Requests are executed one at a time, in arrival order. Concurrency with
//! other processes is handled by SQLite's write lock and the advisory locks,
//! exactly as for any other writer.

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseLock, ObtainOutcome, PartitionKey, RefreshOutcome, ReleaseOutcome, WorkerId};
use crate::repository::StreamRepository;
use crate::types::{AppendResult, EventData, EventId, ExpectedVersion, LinkResult, Stream};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer thread.
pub enum WriteRequest {
    /// Append events to a stream.
    Append {
        events: Vec<EventData>,
        stream: Stream,
        expected: ExpectedVersion,
        response: oneshot::Sender<Result<AppendResult>>,
    },
    /// Link stored events into a stream.
    Link {
        event_ids: Vec<EventId>,
        stream: Stream,
        expected: ExpectedVersion,
        response: oneshot::Sender<Result<LinkResult>>,
    },
    /// Remove a stream's entries.
    DeleteStream {
        stream: Stream,
        response: oneshot::Sender<Result<usize>>,
    },
    /// Rewrite stored events in place.
    UpdateMessages {
        events: Vec<EventData>,
        response: oneshot::Sender<Result<()>>,
    },
    /// Take a partition lease.
    ObtainLease {
        partition: PartitionKey,
        worker: WorkerId,
        response: oneshot::Sender<Result<ObtainOutcome>>,
    },
    /// Extend a partition lease.
    RefreshLease {
        lease: Lease,
        response: oneshot::Sender<Result<RefreshOutcome>>,
    },
    /// Free a partition lease.
    ReleaseLease {
        partition: PartitionKey,
        worker: WorkerId,
        response: oneshot::Sender<Result<ReleaseOutcome>>,
    },
    /// Stop the writer.
    Shutdown,
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Cloneable handle for submitting writes.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Sends a request and waits for its answer.
    ///
    /// # Rust Pattern: Request Builder Closure
    ///
    /// Each request variant carries its own response type. Passing a closure
    /// that wraps the oneshot sender lets one function do the send/await
    /// dance for all of them.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Shutdown("writer"))?;
        response_rx.await.map_err(|_| Error::Shutdown("writer"))?
    }

    /// Appends events to a stream.
    pub async fn append(
        &self,
        events: Vec<EventData>,
        stream: Stream,
        expected: ExpectedVersion,
    ) -> Result<AppendResult> {
        self.request(|response| WriteRequest::Append {
            events,
            stream,
            expected,
            response,
        })
        .await
    }

    /// Links stored events into a stream.
    pub async fn link(
        &self,
        event_ids: Vec<EventId>,
        stream: Stream,
        expected: ExpectedVersion,
    ) -> Result<LinkResult> {
        self.request(|response| WriteRequest::Link {
            event_ids,
            stream,
            expected,
            response,
        })
        .await
    }

    /// Removes a stream's entries.
    pub async fn delete_stream(&self, stream: Stream) -> Result<usize> {
        self.request(|response| WriteRequest::DeleteStream { stream, response })
            .await
    }

    /// Rewrites stored events in place.
    pub async fn update_messages(&self, events: Vec<EventData>) -> Result<()> {
        self.request(|response| WriteRequest::UpdateMessages { events, response })
            .await
    }

    /// Takes a partition lease.
    pub async fn obtain_lease(
        &self,
        partition: PartitionKey,
        worker: WorkerId,
    ) -> Result<ObtainOutcome> {
        self.request(|response| WriteRequest::ObtainLease {
            partition,
            worker,
            response,
        })
        .await
    }

    /// Extends a partition lease.
    pub async fn refresh_lease(&self, lease: Lease) -> Result<RefreshOutcome> {
        self.request(|response| WriteRequest::RefreshLease { lease, response })
            .await
    }

    /// Frees a partition lease.
    pub async fn release_lease(
        &self,
        partition: PartitionKey,
        worker: WorkerId,
    ) -> Result<ReleaseOutcome> {
        self.request(|response| WriteRequest::ReleaseLease {
            partition,
            worker,
            response,
        })
        .await
    }

    /// Asks the writer to stop after the requests already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop until shutdown or until every handle is dropped.
pub async fn run_writer(
    repo: StreamRepository,
    leases: LeaseLock,
    mut rx: mpsc::Receiver<WriteRequest>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::Append {
                events,
                stream,
                expected,
                response,
            } => {
                let _ = response.send(repo.append(events, &stream, expected));
            }
            WriteRequest::Link {
                event_ids,
                stream,
                expected,
                response,
            } => {
                let _ = response.send(repo.link(&event_ids, &stream, expected));
            }
            WriteRequest::DeleteStream { stream, response } => {
                let _ = response.send(repo.delete_stream(&stream));
            }
            WriteRequest::UpdateMessages { events, response } => {
                let _ = response.send(repo.update_messages(&events));
            }
            WriteRequest::ObtainLease {
                partition,
                worker,
                response,
            } => {
                let _ = response.send(leases.obtain(&partition, &worker));
            }
            WriteRequest::RefreshLease { lease, response } => {
                let _ = response.send(leases.refresh(&lease));
            }
            WriteRequest::ReleaseLease {
                partition,
                worker,
                response,
            } => {
                let _ = response.send(leases.release(&partition, &worker));
            }
            WriteRequest::Shutdown => break,
        }
    }
}

/// Spawns the writer on a dedicated thread.
///
/// Returns a handle for submitting requests and the thread's join handle.
pub fn spawn_writer(
    repo: StreamRepository,
    leases: LeaseLock,
) -> Result<(WriterHandle, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| Error::Spawn {
            name: "writer",
            source,
        })?;

    let join = std::thread::Builder::new()
        .name("ledgerdb-writer".to_string())
        .spawn(move || rt.block_on(run_writer(repo, leases, rx)))
        .map_err(|source| Error::Spawn {
            name: "writer",
            source,
        })?;

    Ok((WriterHandle { tx }, join))
}

// =============================================================================
// Tests
// =============================================================================
