//! # Textile Gateway Core Library
//!
//! This crate is the acquisition and concurrency engine of a machine
//! data-acquisition gateway. It polls a machine controller over a
//! register-oriented link, derives production-process boundaries from a
//! single flag, funnels externally reported defect events into hardware pulse
//! writes, and persists everything to an append-only document sink without
//! letting storage latency stall the poll loop.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: telemetry frames, the `ProcessTracker` lifecycle state
//!   machine and the fixed-cadence `Poller`.
//! - **`config`**: layered `GatewayConfig` (defaults, TOML, environment) with
//!   semantic validation.
//! - **`defects`**: the `DefectFunnel` gate and the single sequential worker
//!   that pulse-writes the defect flag.
//! - **`error`**: the `GatewayError` taxonomy shared by every component.
//! - **`gateway`**: the `Gateway` service that owns all components, spawns
//!   their tasks and answers queries.
//! - **`hardware`**: the `RegisterTransport` capability, the serializing
//!   `RegisterChannel`, the register map and a simulated controller.
//! - **`metrics`**: process-wide atomic counters.
//! - **`queue`**: bounded drop-oldest FIFO shared by producers and the writer.
//! - **`retry`**: the `RetryPolicy` applied to every external call.
//! - **`storage`**: tagged records, the `DocumentSink` trait, its memory and
//!   JSON-lines implementations, and the rate-limited `StorageWriter`.
//! - **`tracing_setup`**: structured logging initialization.

pub mod acquisition;
pub mod config;
pub mod defects;
pub mod error;
pub mod gateway;
pub mod hardware;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod tracing_setup;

pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
