//! Gateway configuration using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (`GatewayConfig::default()`)
//! 2. A TOML file (typically `config/gateway.toml`)
//! 3. Environment variables prefixed with `TEXTILE_GW_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use textile_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load_from("config/gateway.toml")?;
//! config.validate()?;
//! println!("Polling every {:?}", config.poller.interval);
//! # Ok::<(), textile_gateway::error::GatewayError>(())
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::retry::RetryPolicy;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TEXTILE_GW_";

/// Largest register block a single read transaction may cover.
pub const MAX_BLOCK_REGISTERS: u16 = 125;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Register link settings
    pub link: LinkConfig,
    /// Register addresses of the telemetry fields
    pub registers: RegisterConfig,
    /// Poll loop settings
    pub poller: PollerConfig,
    /// Queue sizing
    pub queues: QueueConfig,
    /// Storage writer and sink settings
    pub storage: StorageConfig,
    /// Defect funnel settings
    pub defects: DefectConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Textile Gateway".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Register link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Opaque address of the controller (host:port, device path, ...)
    pub target: String,
    /// Unit / slave identifier on the link
    pub unit_id: u8,
    /// Policy for establishing the link
    pub connect: RetryPolicy,
    /// Policy for individual register transactions
    pub io: RetryPolicy,
    /// Upper bound on a single transaction
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:502".to_string(),
            unit_id: 1,
            connect: RetryPolicy::new(3, Duration::from_secs(1)),
            io: RetryPolicy::new(3, Duration::from_millis(200)),
            io_timeout: Duration::from_secs(1),
        }
    }
}

/// Register addresses. Deployments disagree on address bases, so none of
/// these are treated as constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    /// Machine status code
    pub status: u16,
    /// Production counter (first word when two-word)
    pub total_production: u16,
    /// Alarm code
    pub alarm: u16,
    /// Fabric length counter (first word when two-word)
    pub fabric_length: u16,
    /// Process start flag (lifecycle edge signal)
    pub process_start: u16,
    /// Machine running flag
    pub machine_running: u16,
    /// Defect flag, pulse-written by the defect funnel
    pub defect_flag: u16,
    /// Width of the two counters in 16-bit words (1 or 2, high word first)
    pub counter_words: u8,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            status: 0,
            total_production: 1,
            alarm: 2,
            fabric_length: 3,
            process_start: 4,
            machine_running: 5,
            defect_flag: 6,
            counter_words: 1,
        }
    }
}

/// Poll loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Fixed poll period
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity K of the acquisition and persistence queues
    pub capacity: usize,
    /// Pending defect events the funnel accepts before rejecting
    pub defect_backlog: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            defect_backlog: 32,
        }
    }
}

/// Storage writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Writer tick; at most one entry is written per tick
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Attempts per entry and wait before re-trying it
    pub retry: RetryPolicy,
    /// Upper bound on a single sink insert
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// JSON-lines sink location
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
            write_timeout: Duration::from_secs(2),
            path: PathBuf::from("data/records.jsonl"),
        }
    }
}

/// Defect funnel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefectConfig {
    /// How long the defect flag is held at 1 before being reset
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
}

impl Default for DefectConfig {
    fn default() -> Self {
        Self {
            hold: Duration::from_millis(500),
        }
    }
}

impl RegisterConfig {
    /// Every (field name, address) pair occupied by the telemetry block,
    /// including the second word of two-word counters.
    pub fn occupied(&self) -> Vec<(&'static str, u16)> {
        let mut fields = vec![
            ("status", self.status),
            ("total_production", self.total_production),
            ("alarm", self.alarm),
            ("fabric_length", self.fabric_length),
            ("process_start", self.process_start),
            ("machine_running", self.machine_running),
            ("defect_flag", self.defect_flag),
        ];
        if self.counter_words == 2 {
            fields.push(("total_production+1", self.total_production.saturating_add(1)));
            fields.push(("fabric_length+1", self.fabric_length.saturating_add(1)));
        }
        fields
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file layered over defaults and
    /// environment overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack used by [`GatewayConfig::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> GatewayResult<()> {
        let invalid = |msg: String| Err(GatewayError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.link.target.trim().is_empty() {
            return invalid("link.target must not be empty".to_string());
        }
        if self.link.io_timeout.is_zero() {
            return invalid("link.io_timeout must be greater than zero".to_string());
        }

        if self.poller.interval.is_zero() {
            return invalid("poller.interval must be greater than zero".to_string());
        }
        if self.storage.tick.is_zero() {
            return invalid("storage.tick must be greater than zero".to_string());
        }
        if self.storage.tick >= self.poller.interval {
            return invalid(format!(
                "storage.tick ({:?}) must be shorter than poller.interval ({:?})",
                self.storage.tick, self.poller.interval
            ));
        }
        if self.storage.write_timeout.is_zero() {
            return invalid("storage.write_timeout must be greater than zero".to_string());
        }

        if self.queues.capacity == 0 {
            return invalid("queues.capacity must be at least 1".to_string());
        }
        if self.queues.defect_backlog == 0 {
            return invalid("queues.defect_backlog must be at least 1".to_string());
        }

        if !matches!(self.registers.counter_words, 1 | 2) {
            return invalid(format!(
                "registers.counter_words must be 1 or 2, got {}",
                self.registers.counter_words
            ));
        }

        let mut seen: HashMap<u16, &str> = HashMap::new();
        for (name, address) in self.registers.occupied() {
            if let Some(previous) = seen.insert(address, name) {
                return invalid(format!(
                    "Register address {} is used by both '{}' and '{}'",
                    address, previous, name
                ));
            }
        }

        let occupied = self.registers.occupied();
        let min = occupied.iter().map(|(_, a)| *a).min().unwrap_or(0);
        let max = occupied.iter().map(|(_, a)| *a).max().unwrap_or(0);
        let span = u32::from(max) - u32::from(min) + 1;
        if span > u32::from(MAX_BLOCK_REGISTERS) {
            return invalid(format!(
                "Telemetry registers span {} addresses ({}..={}); a single read covers at most {}",
                span,
                min,
                max,
                MAX_BLOCK_REGISTERS
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.connect.max_attempts(), 3);
        assert_eq!(config.link.connect.delay(), Duration::from_secs(1));
        assert_eq!(config.queues.capacity, 100);
        assert_eq!(config.defects.hold, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = GatewayConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_tick_must_beat_poll_interval() {
        let mut config = GatewayConfig::default();
        config.storage.tick = Duration::from_secs(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.tick"));
    }

    #[test]
    fn test_duplicate_register_addresses() {
        let mut config = GatewayConfig::default();
        config.registers.defect_flag = config.registers.status;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("used by both"));
    }

    #[test]
    fn test_two_word_counters_occupy_next_address() {
        let mut config = GatewayConfig::default();
        config.registers.counter_words = 2;
        // total_production = 1 now also occupies 2, which is the alarm register.
        assert!(config.validate().is_err());

        config.registers = RegisterConfig {
            status: 100,
            total_production: 101,
            alarm: 103,
            fabric_length: 104,
            process_start: 106,
            machine_running: 107,
            defect_flag: 108,
            counter_words: 2,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_block_span_limit() {
        let mut config = GatewayConfig::default();
        config.registers.defect_flag = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_top_address_is_a_span_error() {
        let mut config = GatewayConfig::default();
        config.registers.defect_flag = u16::MAX;
        match config.validate() {
            Err(GatewayError::Configuration(msg)) => assert!(msg.contains("65536"), "{msg}"),
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = GatewayConfig::default();
        config.queues.capacity = 0;
        assert!(config.validate().is_err());
    }
}
