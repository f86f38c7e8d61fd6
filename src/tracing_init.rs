//! Tracing Infrastructure
//!
//! Structured logging for the instrument task and the CLI, built on `tracing` and
//! `tracing-subscriber`. Level and line layout come from the `[application]`
//! section; `RUST_LOG` wins over the configured level. Output goes to stderr so
//! that command output on stdout stays machine readable.
//!
//! # Example
//! ```no_run
//! use rust_vna::{config::VnaConfig, tracing_init};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VnaConfig::load()?;
//! tracing_init::init_from_config(&config)?;
//! info!(host = %config.bridge.host, "Connecting");
//! # Ok(())
//! # }
//! ```

use std::io::IsTerminal;

use crate::config::{LogFormat, VnaConfig};
use crate::error::{AppResult, VnaError};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Tracing configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Line layout
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the application configuration
    pub fn from_config(config: &VnaConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
        })
    }

    /// Formatting layer writing to stderr; colors only when stderr is a terminal.
    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let ansi = std::io::stderr().is_terminal();
        match self.format {
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .boxed(),
            LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        }
    }
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &VnaConfig) -> AppResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`,
/// so tests and embedding applications may call it freely.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        tracing::debug!("Global subscriber already installed");
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(config.layer().with_filter(env_filter))
        .try_init()
        .map_err(|e| VnaError::Configuration(format!("Failed to initialize tracing: {e}")))
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(VnaError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
