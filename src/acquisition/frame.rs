//! Telemetry frame assembled from one register block read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine status register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    /// 0
    Stopped,
    /// 1
    Running,
    /// 2
    Idle,
    /// 3
    Fault,
}

impl MachineStatus {
    /// Decode a status register value.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(MachineStatus::Stopped),
            1 => Some(MachineStatus::Running),
            2 => Some(MachineStatus::Idle),
            3 => Some(MachineStatus::Fault),
            _ => None,
        }
    }

    /// Register value for this status.
    pub fn code(self) -> u16 {
        match self {
            MachineStatus::Stopped => 0,
            MachineStatus::Running => 1,
            MachineStatus::Idle => 2,
            MachineStatus::Fault => 3,
        }
    }
}

/// One decoded snapshot of the controller.
///
/// Counters are non-decreasing while a process is open; a decrease marks a
/// counter reset and is never read as a negative delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Machine status
    pub status: MachineStatus,
    /// Production counter
    pub total_production: u32,
    /// Fabric length counter
    pub fabric_length: u32,
    /// Alarm code, 0 = no alarm
    pub alarm_code: u16,
    /// Defect flag register
    pub defect_flag: bool,
    /// Process start flag (lifecycle edge signal)
    pub process_start: bool,
    /// Machine running flag
    pub machine_running: bool,
    /// When the block was read
    pub timestamp: DateTime<Utc>,
}

impl TelemetryFrame {
    /// Important-change predicate: true when any observable field differs.
    /// The timestamp is deliberately not compared.
    pub fn differs_from(&self, other: &TelemetryFrame) -> bool {
        self.status != other.status
            || self.total_production != other.total_production
            || self.fabric_length != other.fabric_length
            || self.alarm_code != other.alarm_code
            || self.process_start != other.process_start
            || self.machine_running != other.machine_running
            || self.defect_flag != other.defect_flag
    }

    /// Whether the controller reports an alarm.
    pub fn has_alarm(&self) -> bool {
        self.alarm_code != 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn frame(process_start: bool, production: u32, length: u32) -> TelemetryFrame {
        TelemetryFrame {
            status: MachineStatus::Running,
            total_production: production,
            fabric_length: length,
            alarm_code: 0,
            defect_flag: false,
            process_start,
            machine_running: true,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0..4 {
            let status = MachineStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(MachineStatus::from_code(9), None);
    }

    #[test]
    fn timestamp_alone_is_not_a_change() {
        let a = frame(true, 10, 5);
        let mut b = a.clone();
        b.timestamp = a.timestamp + chrono::Duration::seconds(1);
        assert!(!b.differs_from(&a));
    }

    #[test]
    fn every_observable_field_is_a_change() {
        let base = frame(false, 10, 5);
        let mutations: Vec<fn(&mut TelemetryFrame)> = vec![
            |f| f.status = MachineStatus::Fault,
            |f| f.total_production += 1,
            |f| f.fabric_length += 1,
            |f| f.alarm_code = 7,
            |f| f.process_start = true,
            |f| f.machine_running = false,
            |f| f.defect_flag = true,
        ];
        for mutate in mutations {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert!(changed.differs_from(&base));
        }
    }
}
