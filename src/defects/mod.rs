//! Defect events from the inspection subsystem.
//!
//! ```text
//! DefectEvent ─► gate ─► backlog (mpsc, bounded) ─► DefectWorker
//!                                                     │ re-validate gate
//!                                                     │ assert flag = 1
//!                                                     │ hold
//!                                                     │ deassert flag = 0
//!                                                     └► DefectRecord ─► PersistenceQueue
//! ```
//!
//! Exactly one worker consumes the backlog, so pulse writes for distinct
//! defects never overlap.

pub mod funnel;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::acquisition::{AcquisitionState, Process};
use crate::error::RejectReason;
use crate::hardware::RegisterChannel;

pub use funnel::{defect_funnel, DefectFunnel, DefectWorker};

/// Defect report delivered by the inspection subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectEvent {
    /// Inspection-side identifier
    #[serde(alias = "detectionId")]
    pub detection_id: String,
    /// Number of defects in this detection
    #[serde(default = "one")]
    pub count: u32,
    /// Detector confidence, 0.0 to 1.0
    #[serde(default)]
    pub confidence: f64,
    /// When the event reached the gateway
    #[serde(alias = "arrivalTime", default = "Utc::now")]
    pub arrival_time: DateTime<Utc>,
}

fn one() -> u32 {
    1
}

impl DefectEvent {
    /// An event arriving now.
    pub fn new(detection_id: impl Into<String>, count: u32, confidence: f64) -> Self {
        Self {
            detection_id: detection_id.into(),
            count,
            confidence,
            arrival_time: Utc::now(),
        }
    }
}

/// Persisted form of a processed defect event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectRecord {
    /// Inspection-side identifier
    pub detection_id: String,
    /// Process open at processing time
    pub process_id: Uuid,
    /// Operator-facing id of that process
    pub textile_id: String,
    /// Number of defects
    pub count: u32,
    /// Detector confidence
    pub confidence: f64,
    /// When the event reached the gateway
    pub arrival_time: DateTime<Utc>,
    /// When the worker finished the pulse
    pub processed_at: DateTime<Utc>,
    /// Fabric length of the latest frame when the worker processed the event
    pub length_at_detection: u32,
    /// Whether the assert write reached the controller
    pub pulse_acknowledged: bool,
}

/// Gate check: a defect can only be attributed to an open process on a
/// running machine.
pub fn admit(state: &AcquisitionState) -> Result<&Process, RejectReason> {
    let process = state.process.as_ref().ok_or(RejectReason::NoActiveProcess)?;
    let frame = state.frame.as_ref().ok_or(RejectReason::NoTelemetry)?;
    if !frame.machine_running {
        return Err(RejectReason::MachineNotRunning);
    }
    Ok(process)
}

/// Write the defect flag back to 0. Used at start-up and after a failed
/// deassert, since a pulse is not atomic across a link loss.
pub async fn reset_defect_flag(channel: &RegisterChannel, address: u16) -> bool {
    let reset = channel.write_register(address, 0).await;
    if reset {
        info!(address, "Defect flag reset");
    } else {
        error!(address, "Defect flag reset failed; flag may be left asserted");
    }
    reset
}
