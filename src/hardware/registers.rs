//! Register layout: where each telemetry field lives and how a block read
//! decodes into a [`TelemetryFrame`].

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::acquisition::frame::{MachineStatus, TelemetryFrame};
use crate::config::RegisterConfig;

/// Resolved register layout with the covering read block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    config: RegisterConfig,
    block_start: u16,
    block_len: u16,
}

impl RegisterMap {
    /// Build the map. The configuration is expected to have passed
    /// `GatewayConfig::validate`; a span wider than one `u16` is clamped and
    /// the resulting block simply fails to decode.
    pub fn new(config: RegisterConfig) -> Self {
        let occupied = config.occupied();
        let block_start = occupied.iter().map(|(_, a)| *a).min().unwrap_or(0);
        let block_end = occupied.iter().map(|(_, a)| *a).max().unwrap_or(0);
        let span = u32::from(block_end) - u32::from(block_start) + 1;
        Self {
            config,
            block_start,
            block_len: u16::try_from(span).unwrap_or(u16::MAX),
        }
    }

    /// First register of the telemetry block.
    pub fn block_start(&self) -> u16 {
        self.block_start
    }

    /// Number of registers in the telemetry block.
    pub fn block_len(&self) -> u16 {
        self.block_len
    }

    /// Address of the defect flag.
    pub fn defect_flag(&self) -> u16 {
        self.config.defect_flag
    }

    /// The underlying configuration.
    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    /// Decode a block previously read from `block_start()`.
    ///
    /// Returns `None` if the block does not cover every configured field.
    pub fn decode(&self, block: &[u16], timestamp: DateTime<Utc>) -> Option<TelemetryFrame> {
        let config = &self.config;
        let status_code = self.word(block, config.status)?;
        let status = MachineStatus::from_code(status_code).unwrap_or_else(|| {
            warn!(status_code, "Unknown machine status code, treating as FAULT");
            MachineStatus::Fault
        });

        Some(TelemetryFrame {
            status,
            total_production: self.counter(block, config.total_production)?,
            fabric_length: self.counter(block, config.fabric_length)?,
            alarm_code: self.word(block, config.alarm)?,
            defect_flag: self.word(block, config.defect_flag)? != 0,
            process_start: self.word(block, config.process_start)? != 0,
            machine_running: self.word(block, config.machine_running)? != 0,
            timestamp,
        })
    }

    fn word(&self, block: &[u16], address: u16) -> Option<u16> {
        let offset = address.checked_sub(self.block_start)?;
        block.get(usize::from(offset)).copied()
    }

    fn counter(&self, block: &[u16], address: u16) -> Option<u32> {
        match self.config.counter_words {
            2 => {
                let high = self.word(block, address)?;
                let low = self.word(block, address.checked_add(1)?)?;
                Some((u32::from(high) << 16) | u32::from(low))
            }
            _ => self.word(block, address).map(u32::from),
        }
    }

    /// Register words for a counter value, in address order.
    pub fn encode_counter(&self, value: u32) -> Vec<u16> {
        match self.config.counter_words {
            2 => vec![(value >> 16) as u16, (value & 0xFFFF) as u16],
            _ => vec![value.min(u32::from(u16::MAX)) as u16],
        }
    }
}
