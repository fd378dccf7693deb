//! Persistence side of the gateway.
//!
//! The durable store is an opaque append-only document sink behind the
//! [`DocumentSink`] trait. Records are tagged by kind so a single sink can
//! hold telemetry, defect and process-summary documents:
//!
//! ```json
//! {"kind": "telemetry", "frame": {...}, "process_id": "...", "textile_id": "..."}
//! {"kind": "defect", "detection_id": "...", ...}
//! {"kind": "process_summary", "process_id": "...", ...}
//! ```
//!
//! Delivery is at-least-once at best: there is no idempotency key, so a write
//! that timed out but actually landed will be stored again on retry.

pub mod jsonl;
pub mod memory;
pub mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acquisition::frame::TelemetryFrame;
use crate::acquisition::tracker::ProcessSummary;
use crate::defects::DefectRecord;
use crate::error::GatewayResult;

pub use jsonl::JsonLinesSink;
pub use memory::MemorySink;
pub use writer::StorageWriter;

/// A persisted telemetry frame and the process it belongs to, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// The frame that passed the important-change predicate
    pub frame: TelemetryFrame,
    /// Process open when the frame was read
    pub process_id: Option<Uuid>,
    /// Operator-facing id of that process
    pub textile_id: Option<String>,
}

/// Document written to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// Changed telemetry frame
    Telemetry(TelemetryRecord),
    /// Processed defect event
    Defect(DefectRecord),
    /// Closed process
    ProcessSummary(ProcessSummary),
}

/// Record discriminant used for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// `telemetry`
    Telemetry,
    /// `defect`
    Defect,
    /// `process_summary`
    ProcessSummary,
}

impl Record {
    /// Discriminant of this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Telemetry(_) => RecordKind::Telemetry,
            Record::Defect(_) => RecordKind::Defect,
            Record::ProcessSummary(_) => RecordKind::ProcessSummary,
        }
    }

    /// Time used for windowed history reads: acquisition time for telemetry,
    /// processing time for defects, close time for summaries.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Telemetry(r) => r.frame.timestamp,
            Record::Defect(r) => r.processed_at,
            Record::ProcessSummary(s) => s.end_time,
        }
    }

    /// Whether this record matches a history query.
    pub fn matches(&self, kind: RecordKind, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let at = self.timestamp();
        self.kind() == kind && at >= from && at <= to
    }
}

/// Append-only document store.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Append one record. Failure means the record may or may not be stored.
    async fn insert(&self, record: &Record) -> GatewayResult<()>;

    /// Records of `kind` whose timestamp lies in `[from, to]`, oldest first.
    async fn query(
        &self,
        kind: RecordKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<Record>>;
}
