//! Background consumer draining both queues into the sink.
//!
//! ```text
//! PersistenceQueue ─┐
//!                   ├─► StorageWriter (one entry per tick) ─► DocumentSink
//! AcquisitionQueue ─┘
//! ```
//!
//! The writer ticks faster than the poller and writes at most one entry per
//! tick, alternating between the two queues so neither starves. A failing
//! entry goes back to the head of its queue and that queue is left alone for
//! `retry.delay`; after `retry.max_attempts` failures the entry is dropped.
//! A slow sink can cost at most `write_timeout` per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{DocumentSink, Record, RecordKind};
use crate::config::StorageConfig;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::queue::BoundedQueue;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Persistence,
    Acquisition,
}

impl Source {
    fn index(self) -> usize {
        match self {
            Source::Persistence => 0,
            Source::Acquisition => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Source::Persistence => Source::Acquisition,
            Source::Acquisition => Source::Persistence,
        }
    }
}

/// Result of one writer tick that found work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The entry reached the sink.
    Written(RecordKind),
    /// The write failed and the entry was put back with this attempt count.
    Retrying {
        /// Failed attempts so far.
        attempts: u32,
    },
    /// The entry was discarded: it failed its last attempt, or its queue
    /// filled up while it was being written and it was evicted as the oldest.
    Dropped,
}

/// Rate-limited drain of the acquisition and persistence queues.
pub struct StorageWriter {
    sink: Arc<dyn DocumentSink>,
    persistence: Arc<BoundedQueue<Record>>,
    acquisition: Arc<BoundedQueue<Record>>,
    tick: Duration,
    retry: RetryPolicy,
    write_timeout: Duration,
    metrics: Arc<GatewayMetrics>,
    next: Source,
    backoff: [Option<Instant>; 2],
}

impl StorageWriter {
    /// Build a writer over the two queues.
    pub fn new(
        sink: Arc<dyn DocumentSink>,
        persistence: Arc<BoundedQueue<Record>>,
        acquisition: Arc<BoundedQueue<Record>>,
        config: &StorageConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            sink,
            persistence,
            acquisition,
            tick: config.tick,
            retry: config.retry,
            write_timeout: config.write_timeout,
            metrics,
            next: Source::Persistence,
            backoff: [None, None],
        }
    }

    /// Tick until `shutdown` flips. A write in progress completes first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "Storage writer started");
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.write_one().await;
                }
            }
        }

        info!(
            persistence_pending = self.persistence.len(),
            acquisition_pending = self.acquisition.len(),
            "Storage writer stopped"
        );
    }

    /// Write at most one entry. `None` when no queue had a ready entry.
    pub async fn write_one(&mut self) -> Option<WriteOutcome> {
        let source = self.pick()?;
        let queue = Arc::clone(self.queue(source));
        let mut entry = queue.pop()?;
        let kind = entry.payload.kind();

        let result = match timeout(self.write_timeout, self.sink.insert(&entry.payload)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout("sink insert")),
        };

        match result {
            Ok(()) => {
                GatewayMetrics::incr(&self.metrics.store_writes);
                self.backoff[source.index()] = None;
                debug!(queue = queue.name(), ?kind, "Record stored");
                Some(WriteOutcome::Written(kind))
            }
            Err(e) => {
                GatewayMetrics::incr(&self.metrics.store_failures);
                entry.attempts += 1;
                if entry.attempts >= self.retry.max_attempts() {
                    GatewayMetrics::incr(&self.metrics.store_drops);
                    self.backoff[source.index()] = None;
                    error!(
                        queue = queue.name(),
                        ?kind,
                        attempts = entry.attempts,
                        enqueued_at = %entry.enqueued_at,
                        error = %e,
                        "Dropping record after exhausting write attempts"
                    );
                    return Some(WriteOutcome::Dropped);
                }

                let attempts = entry.attempts;
                // Counted as an eviction by the queue.
                if queue.requeue_front(entry).is_some() {
                    self.backoff[source.index()] = None;
                    return Some(WriteOutcome::Dropped);
                }
                self.backoff[source.index()] = Some(Instant::now() + self.retry.delay());
                warn!(
                    queue = queue.name(),
                    ?kind,
                    attempts,
                    max_attempts = self.retry.max_attempts(),
                    error = %e,
                    "Record write failed, will retry"
                );
                Some(WriteOutcome::Retrying { attempts })
            }
        }
    }

    fn queue(&self, source: Source) -> &Arc<BoundedQueue<Record>> {
        match source {
            Source::Persistence => &self.persistence,
            Source::Acquisition => &self.acquisition,
        }
    }

    fn ready(&self, source: Source) -> bool {
        let waited = self.backoff[source.index()].map_or(true, |until| Instant::now() >= until);
        waited && !self.queue(source).is_empty()
    }

    /// Round-robin between the queues, falling back to whichever is ready.
    fn pick(&mut self) -> Option<Source> {
        let preferred = self.next;
        let source = [preferred, preferred.other()]
            .into_iter()
            .find(|s| self.ready(*s))?;
        self.next = source.other();
        Some(source)
    }
}
