//! In-memory sink for tests and the simulator.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{DocumentSink, Record, RecordKind};
use crate::error::{GatewayError, GatewayResult};

/// Vector-backed [`DocumentSink`] with an availability switch for simulating
/// store outages.
#[derive(Debug)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    available: AtomicBool,
    fail_next: AtomicU32,
    inserts: AtomicU32,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    /// An empty, available sink.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            inserts: AtomicU32::new(0),
        }
    }

    /// Make every insert fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` inserts, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Insert calls received, successful or not.
    pub fn insert_calls(&self) -> u32 {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Copy of every stored record in insertion order.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Stored records of one kind.
    pub fn records_of(&self, kind: RecordKind) -> Vec<Record> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn insert(&self, record: &Record) -> GatewayResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence("sink unavailable".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(GatewayError::Persistence("injected insert failure".into()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn query(
        &self,
        kind: RecordKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<Record>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence("sink unavailable".into()));
        }
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.matches(kind, from, to))
            .cloned()
            .collect())
    }
}
