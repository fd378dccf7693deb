//! Logging setup.
//!
//! The gateway logs through `tracing`; this module installs the global
//! `tracing-subscriber` registry from the `[application]` section. Events
//! from this crate are emitted at the configured level, everything else
//! (tokio, figment) at `warn` and above. `RUST_LOG`, when set, replaces the
//! computed filter entirely.
//!
//! ```no_run
//! use textile_gateway::{config::GatewayConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load_from("config/gateway.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ApplicationConfig;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// Line format of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, coloured; for a terminal
    Pretty,
    /// One line per event, no colour; for journald and plain files
    Compact,
    /// One JSON object per event; for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(GatewayError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Level for this crate's events
    pub level: Level,
    /// Event format
    pub format: LogFormat,
    /// Annotate events with source file and line
    pub source_location: bool,
}

impl LogSettings {
    /// Settings from the `[application]` section.
    pub fn from_application(app: &ApplicationConfig) -> GatewayResult<Self> {
        let level = Level::from_str(&app.log_level).map_err(|_| {
            GatewayError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: trace, debug, info, warn, error",
                app.log_level
            ))
        })?;
        let format: LogFormat = app.log_format.parse()?;
        Ok(Self {
            level,
            format,
            // Source locations are noise at info and above.
            source_location: level >= Level::DEBUG,
        })
    }

    /// Filter used when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        format!(
            "warn,{}={}",
            env!("CARGO_CRATE_NAME"),
            self.level.as_str().to_lowercase()
        )
    }
}

/// Install the global subscriber described by `config.application`.
pub fn init_from_config(config: &GatewayConfig) -> GatewayResult<()> {
    init(&LogSettings::from_application(&config.application)?)
}

/// Install the global subscriber.
///
/// Calling this again once a subscriber is installed is a no-op.
pub fn init(settings: &LogSettings) -> GatewayResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.default_directives()));

    let base = fmt::layer()
        .with_target(true)
        .with_file(settings.source_location)
        .with_line_number(settings.source_location);

    let layer = match settings.format {
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_filter(filter)
            .boxed(),
    };

    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| GatewayError::Configuration(format!("Failed to initialize tracing: {}", e)))
}
