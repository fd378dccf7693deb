//! Acquisition: telemetry frames, the process lifecycle and the poll loop.
//!
//! The [`Poller`](poller::Poller) is the only writer of acquisition state. It
//! publishes the latest frame and the open process through a
//! `tokio::sync::watch` channel; readers (the defect funnel, the query
//! surface) only ever see a consistent pair.

pub mod frame;
pub mod poller;
pub mod tracker;

use serde::Serialize;

pub use frame::{MachineStatus, TelemetryFrame};
pub use poller::{PollOutcome, Poller};
pub use tracker::{Process, ProcessSummary, ProcessTracker, Transition};

/// Latest frame and open process, as published after every successful poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquisitionState {
    /// Most recently polled frame
    pub frame: Option<TelemetryFrame>,
    /// Open process, `None` while Idle
    pub process: Option<Process>,
}

impl AcquisitionState {
    /// Whether a process is open.
    pub fn is_active(&self) -> bool {
        self.process.is_some()
    }
}
