//! Process lifecycle derived from the process-start flag.
//!
//! ```text
//!            flag 0 -> 1
//!   Idle ─────────────────► Active
//!    ▲                        │
//!    └────────────────────────┘
//!            flag 1 -> 0  (emits ProcessSummary)
//! ```
//!
//! Edges are detected by comparing the flag of consecutive polled frames, so
//! a pulse shorter than one poll interval is not seen. That is an accepted
//! limitation of polling. A repeated start signal while Active produces no
//! edge and is absorbed. Only the poller owns a `ProcessTracker`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::frame::TelemetryFrame;

/// An open production process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Unique process identifier
    pub process_id: Uuid,
    /// Operator-facing identifier derived from the start time
    pub textile_id: String,
    /// Timestamp of the frame that opened the process
    pub start_time: DateTime<Utc>,
    /// Production counter at start
    pub start_production: u32,
    /// Fabric length counter at start
    pub start_length: u32,
}

/// Immutable summary emitted once when a process closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Identifier of the closed process
    pub process_id: Uuid,
    /// Operator-facing identifier
    pub textile_id: String,
    /// When the process opened
    pub start_time: DateTime<Utc>,
    /// When the process closed
    pub end_time: DateTime<Utc>,
    /// `end_time - start_time` in minutes
    pub duration_minutes: f64,
    /// Production counter at start
    pub start_production: u32,
    /// Production counter at close
    pub end_production: u32,
    /// Units produced during the process
    pub production_delta: u64,
    /// Length counter at start
    pub start_length: u32,
    /// Length counter at close
    pub end_length: u32,
    /// Fabric produced during the process
    pub fabric_delta: u64,
    /// Counter decreases observed while open
    pub counter_resets: u32,
}

/// Lifecycle change produced by one observed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Idle -> Active
    Opened(Process),
    /// Active -> Idle
    Closed(ProcessSummary),
}

#[derive(Debug)]
struct OpenProcess {
    process: Process,
    last_production: u32,
    last_length: u32,
    production: u64,
    length: u64,
    resets: u32,
}

impl OpenProcess {
    fn advance(&mut self, frame: &TelemetryFrame) {
        self.production += step(
            "total_production",
            self.last_production,
            frame.total_production,
            &mut self.resets,
        );
        self.length += step(
            "fabric_length",
            self.last_length,
            frame.fabric_length,
            &mut self.resets,
        );
        self.last_production = frame.total_production;
        self.last_length = frame.fabric_length;
    }
}

/// A decrease is a counter reset: count the new value from zero.
fn step(counter: &'static str, previous: u32, current: u32, resets: &mut u32) -> u64 {
    if current >= previous {
        u64::from(current - previous)
    } else {
        warn!(counter, previous, current, "Counter decreased during process, treating as reset");
        *resets += 1;
        u64::from(current)
    }
}

/// Two-state lifecycle machine fed one frame per poll.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    previous_flag: bool,
    open: Option<OpenProcess>,
}

impl ProcessTracker {
    /// A tracker in the Idle state with a previous flag of 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently open process, if any.
    pub fn current(&self) -> Option<&Process> {
        self.open.as_ref().map(|open| &open.process)
    }

    /// Whether a process is open.
    pub fn is_active(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one frame and report the lifecycle edge it caused, if any.
    pub fn observe(&mut self, frame: &TelemetryFrame) -> Option<Transition> {
        let previous = std::mem::replace(&mut self.previous_flag, frame.process_start);

        match (previous, frame.process_start) {
            (false, true) => {
                let process = Process {
                    process_id: Uuid::new_v4(),
                    textile_id: textile_id(frame.timestamp),
                    start_time: frame.timestamp,
                    start_production: frame.total_production,
                    start_length: frame.fabric_length,
                };
                self.open = Some(OpenProcess {
                    process: process.clone(),
                    last_production: frame.total_production,
                    last_length: frame.fabric_length,
                    production: 0,
                    length: 0,
                    resets: 0,
                });
                Some(Transition::Opened(process))
            }
            (true, false) => {
                let mut open = self.open.take()?;
                open.advance(frame);
                let process = open.process;
                let elapsed = frame.timestamp - process.start_time;
                Some(Transition::Closed(ProcessSummary {
                    process_id: process.process_id,
                    textile_id: process.textile_id,
                    start_time: process.start_time,
                    end_time: frame.timestamp,
                    duration_minutes: elapsed.num_milliseconds() as f64 / 60_000.0,
                    start_production: process.start_production,
                    end_production: frame.total_production,
                    production_delta: open.production,
                    start_length: process.start_length,
                    end_length: frame.fabric_length,
                    fabric_delta: open.length,
                    counter_resets: open.resets,
                }))
            }
            (true, true) => {
                if let Some(open) = self.open.as_mut() {
                    open.advance(frame);
                }
                None
            }
            (false, false) => None,
        }
    }
}

/// Human-correlatable identifier derived from wall-clock time.
pub fn textile_id(at: DateTime<Utc>) -> String {
    format!("TX-{}", at.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::frame::tests::frame;

    fn at(frame: TelemetryFrame, minutes: i64) -> TelemetryFrame {
        TelemetryFrame {
            timestamp: frame.timestamp + chrono::Duration::minutes(minutes),
            ..frame
        }
    }

    fn summaries(flags: &[bool]) -> usize {
        let mut tracker = ProcessTracker::new();
        flags
            .iter()
            .enumerate()
            .filter_map(|(i, flag)| tracker.observe(&at(frame(*flag, i as u32, 0), i as i64)))
            .filter(|t| matches!(t, Transition::Closed(_)))
            .count()
    }

    #[test]
    fn open_then_close_produces_summary() {
        let mut tracker = ProcessTracker::new();
        let start = frame(true, 1000, 200);
        let opened = tracker.observe(&start);
        let process = match opened {
            Some(Transition::Opened(p)) => p,
            other => panic!("expected open, got {other:?}"),
        };
        assert_eq!(process.start_production, 1000);
        assert_eq!(process.start_length, 200);
        assert!(tracker.is_active());

        let closed = tracker.observe(&at(frame(false, 1450, 610), 42));
        let summary = match closed {
            Some(Transition::Closed(s)) => s,
            other => panic!("expected close, got {other:?}"),
        };
        assert_eq!(summary.process_id, process.process_id);
        assert_eq!(summary.production_delta, 450);
        assert_eq!(summary.fabric_delta, 410);
        assert!((summary.duration_minutes - 42.0).abs() < f64::EPSILON);
        assert_eq!(summary.counter_resets, 0);
        assert!(!tracker.is_active());
    }

    #[test]
    fn one_summary_per_falling_edge() {
        assert_eq!(summaries(&[false, false, false]), 0);
        assert_eq!(summaries(&[true, true, true]), 0);
        assert_eq!(summaries(&[false, true, false]), 1);
        assert_eq!(summaries(&[true, false, true, false, false, true]), 2);
        assert_eq!(summaries(&[false, true, true, false, true, true, false]), 2);
    }

    #[test]
    fn duplicate_start_is_absorbed() {
        let mut tracker = ProcessTracker::new();
        assert!(matches!(
            tracker.observe(&frame(true, 0, 0)),
            Some(Transition::Opened(_))
        ));
        let id = tracker.current().map(|p| p.process_id);
        assert!(tracker.observe(&frame(true, 5, 1)).is_none());
        assert_eq!(tracker.current().map(|p| p.process_id), id);
    }

    #[test]
    fn counter_reset_is_not_a_negative_delta() {
        let mut tracker = ProcessTracker::new();
        tracker.observe(&frame(true, 900, 100));
        tracker.observe(&frame(true, 950, 120));
        // Controller counter reset mid-process.
        tracker.observe(&frame(true, 30, 10));
        let summary = match tracker.observe(&frame(false, 80, 25)) {
            Some(Transition::Closed(s)) => s,
            other => panic!("expected close, got {other:?}"),
        };
        assert_eq!(summary.production_delta, 50 + 30 + 50);
        assert_eq!(summary.fabric_delta, 20 + 10 + 15);
        assert_eq!(summary.counter_resets, 2);
    }

    #[test]
    fn textile_id_uses_wall_clock() {
        let f = frame(true, 0, 0);
        assert_eq!(textile_id(f.timestamp), "TX-20240301-080000");
    }
}
