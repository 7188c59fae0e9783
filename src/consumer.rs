//! # Partitioned Consumer
//!
//! Follows the global log with a [`GlobalCursor`] and hands events to a
//! [`BatchHandler`], one partition at a time, under a partition lease.
//!
//! ```text
//! read_after(position) ─► group by split key ─► for each partition:
//!                                                 obtain lease
//!                                                 refresh ─► handle chunk
//!                                                 refresh ─► handle chunk
//!                                                 release
//! ```
//!
//! A partition that cannot be processed this tick (lease taken, contended or
//! stolen, handler failed) holds the consumer's position back to just before
//! its first unhandled event. Later partitions in the same batch are still
//! handled, so they will be delivered again next tick: handlers must be
//! idempotent.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;
use crate::cursor::GlobalCursor;
use crate::lease::{
    Lease, LeaseLock, ObtainOutcome, PartitionKey, RefreshOutcome, ReleaseOutcome, WorkerId,
};
use crate::types::Event;
use crate::{Error, Result};

/// Receives the events of one partition, in global order.
pub trait BatchHandler: Send {
    /// Handles a chunk of events. An error defers the chunk to a later tick.
    fn handle(&mut self, partition: &PartitionKey, events: &[Event]) -> Result<()>;
}

impl<F> BatchHandler for F
where
    F: FnMut(&PartitionKey, &[Event]) -> Result<()> + Send,
{
    fn handle(&mut self, partition: &PartitionKey, events: &[Event]) -> Result<()> {
        self(partition, events)
    }
}

/// Maps an event to its split key.
pub type Partitioner = Box<dyn Fn(&Event) -> String + Send>;

/// What one [`Consumer::run_once`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerTick {
    /// Events read from the cursor.
    pub fetched: usize,
    /// Events passed to the handler successfully.
    pub handled: usize,
    /// Partitions left for a later tick.
    pub deferred: usize,
    /// Position after the tick.
    pub position: u64,
}

/// A polling consumer of the global log.
pub struct Consumer<H> {
    cursor: GlobalCursor,
    leases: LeaseLock,
    worker: WorkerId,
    handler: H,
    partitioner: Partitioner,
    config: ConsumerConfig,
    position: u64,
}

enum Processed {
    Done(usize),
    /// Stopped early; `handled` events went through before stopping at
    /// `resume_after`.
    Deferred { handled: usize, resume_after: u64 },
}

impl<H: BatchHandler> Consumer<H> {
    /// Creates a consumer starting at the beginning of the log.
    pub fn new(
        cursor: GlobalCursor,
        leases: LeaseLock,
        worker: WorkerId,
        config: ConsumerConfig,
        partitioner: impl Fn(&Event) -> String + Send + 'static,
        handler: H,
    ) -> Self {
        Self {
            cursor,
            leases,
            worker,
            handler,
            partitioner: Box::new(partitioner),
            config,
            position: 0,
        }
    }

    /// Starts after `position` instead of at the beginning.
    pub fn starting_after(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    /// Last global sequence this consumer has fully handled.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The handler, e.g. to inspect what it collected.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Reads one batch and processes it.
    ///
    /// # Errors
    ///
    /// Cursor and lease backend failures. Contention and handler failures are
    /// not errors; they defer the affected partition.
    pub fn run_once(&mut self) -> Result<ConsumerTick> {
        let events = self
            .cursor
            .read_after(self.position, self.config.batch_size)?;
        let Some(last) = events.last() else {
            return Ok(ConsumerTick {
                position: self.position,
                ..ConsumerTick::default()
            });
        };
        let last = last.global_sequence.as_raw();

        let mut tick = ConsumerTick {
            fetched: events.len(),
            ..ConsumerTick::default()
        };
        let mut next_position = last;

        for (split_key, batch) in self.group(events) {
            let partition = PartitionKey::new(self.config.format.clone(), split_key);
            match self.process(&partition, &batch)? {
                Processed::Done(handled) => tick.handled += handled,
                Processed::Deferred {
                    handled,
                    resume_after,
                } => {
                    tick.handled += handled;
                    tick.deferred += 1;
                    next_position = next_position.min(resume_after);
                }
            }
        }

        self.position = self.position.max(next_position);
        tick.position = self.position;
        Ok(tick)
    }

    fn group(&self, events: Vec<Event>) -> Vec<(String, Vec<Event>)> {
        let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for event in events {
            let key = (self.partitioner)(&event);
            match index.get(&key) {
                Some(&i) => groups[i].1.push(event),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![event]));
                }
            }
        }
        groups
    }

    fn process(&mut self, partition: &PartitionKey, batch: &[Event]) -> Result<Processed> {
        let before_first = batch[0].global_sequence.as_raw() - 1;

        let mut lease = match self.leases.obtain(partition, &self.worker)? {
            ObtainOutcome::Obtained(lease) => lease,
            outcome => {
                debug!(partition = %partition, ?outcome, "partition not available");
                return Ok(Processed::Deferred {
                    handled: 0,
                    resume_after: before_first,
                });
            }
        };

        let mut handled = 0;
        let chunk_size = self.config.handler_chunk.max(1);
        for chunk in batch.chunks(chunk_size) {
            let resume_after = chunk[0].global_sequence.as_raw() - 1;

            lease = match self.leases.refresh(&lease)? {
                RefreshOutcome::Refreshed(lease) => lease,
                RefreshOutcome::Stolen => {
                    return Ok(Processed::Deferred {
                        handled,
                        resume_after,
                    });
                }
                outcome => {
                    debug!(partition = %partition, ?outcome, "lease refresh contended");
                    self.release(&lease)?;
                    return Ok(Processed::Deferred {
                        handled,
                        resume_after,
                    });
                }
            };

            if let Err(e) = self.handler.handle(partition, chunk) {
                warn!(partition = %partition, error = %e, "handler failed, deferring partition");
                self.release(&lease)?;
                return Ok(Processed::Deferred {
                    handled,
                    resume_after,
                });
            }
            handled += chunk.len();
        }

        self.release(&lease)?;
        Ok(Processed::Done(handled))
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let outcome = self.leases.release(&lease.partition, &self.worker)?;
        if outcome != ReleaseOutcome::Released {
            debug!(partition = %lease.partition, ?outcome, "lease not released");
        }
        Ok(())
    }
}

// =============================================================================
// Background Consumer
// =============================================================================

/// Handle to a consumer running on its own thread.
pub struct ConsumerHandle<H> {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<Consumer<H>>,
}

impl<H> ConsumerHandle<H> {
    /// Stops the consumer after its current tick and returns it.
    pub fn stop(self) -> Result<Consumer<H>> {
        let _ = self.shutdown.send(());
        self.join.join().map_err(|_| Error::Shutdown("consumer"))
    }
}

/// Runs `consumer` on a dedicated thread, one tick per poll interval.
///
/// Tick failures are logged and retried on the next tick.
pub fn spawn_consumer<H>(mut consumer: Consumer<H>) -> Result<ConsumerHandle<H>>
where
    H: BatchHandler + 'static,
{
    let (shutdown, mut shutdown_rx) = oneshot::channel();
    let interval = consumer.config.poll_interval;
    let name = format!("ledgerdb-consumer-{}", consumer.config.format);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| Error::Spawn {
            name: "consumer",
            source,
        })?;

    let join = thread::Builder::new()
        .name(name)
        .spawn(move || {
            rt.block_on(async {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = ticker.tick() => {
                            if let Err(e) = consumer.run_once() {
                                warn!(worker = %consumer.worker, error = %e, "consumer tick failed");
                            }
                        }
                    }
                }
            });
            consumer
        })
        .map_err(|source| Error::Spawn {
            name: "consumer",
            source,
        })?;

    Ok(ConsumerHandle { shutdown, join })
}
