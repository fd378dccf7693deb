//! Process-wide counters.
//!
//! Every component receives the same `Arc<GatewayMetrics>` and bumps the
//! counters it owns. `snapshot()` is what the query surface reports.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared by the gateway tasks.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub(crate) polls: AtomicU64,
    pub(crate) polls_skipped: AtomicU64,
    pub(crate) frames_enqueued: AtomicU64,
    pub(crate) processes_opened: AtomicU64,
    pub(crate) processes_closed: AtomicU64,
    pub(crate) link_reconnects: AtomicU64,
    pub(crate) io_exhausted: AtomicU64,
    pub(crate) store_writes: AtomicU64,
    pub(crate) store_failures: AtomicU64,
    pub(crate) store_drops: AtomicU64,
    pub(crate) defects_accepted: AtomicU64,
    pub(crate) defects_rejected: AtomicU64,
    pub(crate) defects_processed: AtomicU64,
    pub(crate) pulse_failures: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`] plus queue eviction totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Poll ticks that ran.
    pub polls: u64,
    /// Poll ticks skipped because the block read was unavailable.
    pub polls_skipped: u64,
    /// Frames pushed to the acquisition queue.
    pub frames_enqueued: u64,
    /// Processes opened.
    pub processes_opened: u64,
    /// Processes closed (one summary each).
    pub processes_closed: u64,
    /// Link (re)connections established.
    pub link_reconnects: u64,
    /// Register operations that exhausted their retry budget.
    pub io_exhausted: u64,
    /// Records written to the sink.
    pub store_writes: u64,
    /// Failed sink writes (each attempt counts).
    pub store_failures: u64,
    /// Entries dropped after exhausting their write attempts.
    pub store_drops: u64,
    /// Entries evicted from full queues.
    pub queue_evictions: u64,
    /// Defect events admitted by the gate.
    pub defects_accepted: u64,
    /// Defect events refused (gate, backlog, or re-validation).
    pub defects_rejected: u64,
    /// Defect events turned into records.
    pub defects_processed: u64,
    /// Pulse writes that did not complete.
    pub pulse_failures: u64,
}

impl GatewayMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters. `queue_evictions` is supplied by the caller, since
    /// queues keep their own eviction count.
    pub fn snapshot(&self, queue_evictions: u64) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            polls: load(&self.polls),
            polls_skipped: load(&self.polls_skipped),
            frames_enqueued: load(&self.frames_enqueued),
            processes_opened: load(&self.processes_opened),
            processes_closed: load(&self.processes_closed),
            link_reconnects: load(&self.link_reconnects),
            io_exhausted: load(&self.io_exhausted),
            store_writes: load(&self.store_writes),
            store_failures: load(&self.store_failures),
            store_drops: load(&self.store_drops),
            queue_evictions,
            defects_accepted: load(&self.defects_accepted),
            defects_rejected: load(&self.defects_rejected),
            defects_processed: load(&self.defects_processed),
            pulse_failures: load(&self.pulse_failures),
        }
    }
}
