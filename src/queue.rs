//! Bounded FIFO with drop-oldest backpressure.
//!
//! Producers (the poller, the defect worker) must never block on storage, so
//! a full queue evicts its oldest entry instead of refusing the push. Memory
//! stays bounded at `capacity` entries and losing the oldest unwritten
//! telemetry is preferred over stalling acquisition.
//!
//! One producer and one consumer per queue is the intended use; the
//! `parking_lot::Mutex` makes any mix safe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// A queued payload with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    /// The queued item
    pub payload: T,
    /// When the item was first queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl<T> QueueEntry<T> {
    /// Wrap a payload with a fresh timestamp and no attempts.
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Bounded FIFO shared between one producer and one consumer.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    entries: Mutex<VecDeque<QueueEntry<T>>>,
    pushed: AtomicU64,
    evicted: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a payload, evicting the oldest entry if the queue is full.
    ///
    /// Returns the evicted entry, if any.
    pub fn push(&self, payload: T) -> Option<QueueEntry<T>> {
        self.push_entry(QueueEntry::new(payload))
    }

    /// Append an existing entry, evicting the oldest one if full.
    pub fn push_entry(&self, entry: QueueEntry<T>) -> Option<QueueEntry<T>> {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(entry);
            evicted
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = &evicted {
            self.note_eviction(old);
        }
        evicted
    }

    /// Put an entry back at the head after a failed delivery, keeping FIFO
    /// order. If the queue filled up meanwhile, the returned entry is the one
    /// that had to go: the re-queued entry itself, being the oldest.
    pub fn requeue_front(&self, entry: QueueEntry<T>) -> Option<QueueEntry<T>> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            drop(entries);
            self.note_eviction(&entry);
            return Some(entry);
        }
        entries.push_front(entry);
        None
    }

    /// Remove and return the oldest entry.
    pub fn pop(&self) -> Option<QueueEntry<T>> {
        self.entries.lock().pop_front()
    }

    /// Attempt count and enqueue time of the head entry.
    pub fn peek_meta(&self) -> Option<(u32, DateTime<Utc>)> {
        self.entries
            .lock()
            .front()
            .map(|entry| (entry.attempts, entry.enqueued_at))
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total pushes accepted.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total entries evicted by drop-oldest.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn note_eviction(&self, entry: &QueueEntry<T>) {
        let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            queue = self.name,
            capacity = self.capacity,
            enqueued_at = %entry.enqueued_at,
            attempts = entry.attempts,
            evicted_total = total,
            "Queue full, evicted oldest entry"
        );
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the queued payloads, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.payload.clone())
            .collect()
    }
}
