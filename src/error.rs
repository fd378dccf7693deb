//! Custom error types for the gateway.
//!
//! This module defines the primary error type, `GatewayError`, shared by every
//! component. Using the `thiserror` crate, it keeps the taxonomy of failures in
//! one place so the acquisition loops can decide, per variant, whether a
//! failure is retried, skipped or fatal.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the register link could not be (re)established after
//!   the configured connect attempts. Fatal only at start-up.
//! - **`TransientIo`** / **`Timeout`**: a single register transaction failed.
//!   Retried within the I/O budget, then reduced to "skip this cycle".
//! - **`Persistence`**: the document sink rejected or timed out a write. The
//!   storage writer retries a bounded number of times, then drops the entry.
//! - **`GateRejection`**: a defect event arrived without an open, running
//!   process. Logged and dropped; not an alerting condition.
//! - **`Config`** / **`Configuration`**: parse and semantic configuration
//!   errors, raised while loading or validating `GatewayConfig`.

use std::fmt;

use thiserror::Error;

/// Convenience alias for results using the gateway error type.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Why the defect funnel refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No telemetry frame has been acquired yet.
    NoTelemetry,
    /// No process is currently open.
    NoActiveProcess,
    /// A process is open but the machine-running flag is 0.
    MachineNotRunning,
    /// The defect backlog is full.
    Backlogged,
    /// The funnel worker has stopped.
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::NoTelemetry => "no telemetry acquired yet",
            RejectReason::NoActiveProcess => "no active process",
            RejectReason::MachineNotRunning => "machine not running",
            RejectReason::Backlogged => "defect backlog full",
            RejectReason::ShuttingDown => "defect worker stopped",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The register link could not be established.
    #[error("Connection to '{target}' failed after {attempts} attempt(s): {reason}")]
    Connection {
        /// Configured link target.
        target: String,
        /// Number of connect attempts made.
        attempts: u32,
        /// Last failure reported by the transport.
        reason: String,
    },

    /// A single register read or write failed.
    #[error("Register I/O error: {0}")]
    TransientIo(String),

    /// An external call exceeded its time budget.
    #[error("Operation '{0}' timed out")]
    Timeout(&'static str),

    /// The document sink is unavailable or rejected a record.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A defect event was refused at the funnel gate.
    #[error("Defect event rejected: {0}")]
    GateRejection(RejectReason),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Underlying file or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for GatewayError {
    fn from(value: figment::Error) -> Self {
        GatewayError::Config(Box::new(value))
    }
}

impl GatewayError {
    /// Whether the failure concerns the link itself (as opposed to a single
    /// transaction), so the channel should drop the connection and reconnect.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection { .. } | GatewayError::Timeout(_) | GatewayError::Io(_)
        )
    }
}
