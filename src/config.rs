//! Configuration using Figment
//!
//! Strongly-typed configuration for the analyzer link and sweep defaults.
//! Configuration is loaded from:
//! 1. `config/vna.toml` (base configuration)
//! 2. Environment variables prefixed with `RUST_VNA_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use rust_vna::config::VnaConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VnaConfig::load()?;
//! config.validate()?;
//! println!("Bridge at {}:{}", config.bridge.host, config.bridge.port);
//! # Ok(())
//! # }
//! ```
//!
//! `RUST_VNA_BRIDGE__GPIB_ADDRESS=16` overrides `bridge.gpib_address`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, VnaError};
use crate::protocol::command::InstrumentParameters;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/vna.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_VNA_";

/// Highest primary GPIB address.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnaConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// GPIB-Ethernet bridge
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Dispatcher and sequencer timing
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Parameters applied by the first sweep
    #[serde(default)]
    pub sweep: InstrumentParameters,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line layout on stderr
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Layout of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Prologix GPIB-Ethernet bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge host name or IP address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bridge TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// GPIB address of the analyzer
    #[serde(default = "default_gpib_address")]
    pub gpib_address: u8,
    /// TCP connect timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

/// Dispatcher and sequencer timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Response window of every command, measured from its write
    #[serde(with = "humantime_serde", default = "default_response_timeout")]
    pub response_timeout: Duration,
    /// Delay between completion polls while the instrument sweeps
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Capacity of the request channel into the instrument task
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

// Default value functions
fn default_name() -> String {
    "Rust VNA".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "192.168.178.153".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_gpib_address() -> u8 {
    17
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_request_capacity() -> usize {
    32
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gpib_address: default_gpib_address(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout: default_response_timeout(),
            poll_interval: default_poll_interval(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl VnaConfig {
    /// Load configuration from `config/vna.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `RUST_VNA_`.
    /// Example: `RUST_VNA_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(VnaConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(VnaError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bridge.host.trim().is_empty() {
            return Err(VnaError::Configuration(
                "bridge.host must not be empty".to_string(),
            ));
        }

        if self.bridge.gpib_address > MAX_GPIB_ADDRESS {
            return Err(VnaError::Configuration(format!(
                "Invalid gpib_address {}. Must be 0-{}",
                self.bridge.gpib_address, MAX_GPIB_ADDRESS
            )));
        }

        if self.protocol.response_timeout.is_zero() {
            return Err(VnaError::Configuration(
                "protocol.response_timeout must be greater than zero".to_string(),
            ));
        }

        if self.protocol.request_capacity == 0 {
            return Err(VnaError::Configuration(
                "protocol.request_capacity must be at least 1".to_string(),
            ));
        }

        self.sweep
            .validate()
            .map_err(|e| VnaError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = VnaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge.port, 1234);
        assert_eq!(config.bridge.gpib_address, 17);
        assert_eq!(config.protocol.response_timeout, Duration::from_secs(5));
        assert_eq!(config.protocol.poll_interval, Duration::from_millis(500));
    }

    #[test]
    #[serial]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Bench VNA"
log_level = "debug"
log_format = "json"

[bridge]
host = "10.0.0.5"
gpib_address = 16
connect_timeout = "1s 500ms"

[protocol]
response_timeout = "2s"
poll_interval = "250ms"

[sweep]
start_hz = 100
stop_hz = 10000
points = 401
if_bandwidth = "1khz"
"#
        )
        .unwrap();

        let config = VnaConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Bench VNA");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.bridge.host, "10.0.0.5");
        assert_eq!(config.bridge.port, 1234);
        assert_eq!(config.bridge.gpib_address, 16);
        assert_eq!(config.bridge.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.protocol.response_timeout, Duration::from_secs(2));
        assert_eq!(config.protocol.poll_interval, Duration::from_millis(250));
        assert_eq!(config.sweep.points, 401);
        assert_eq!(config.sweep.power_dbm, -20);
        assert_eq!(
            config.sweep.if_bandwidth,
            crate::protocol::command::IfBandwidth::KHz1
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VnaConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VnaConfig::default());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("RUST_VNA_BRIDGE__GPIB_ADDRESS", "5");
        std::env::set_var("RUST_VNA_APPLICATION__LOG_LEVEL", "trace");
        std::env::set_var("RUST_VNA_APPLICATION__LOG_FORMAT", "pretty");
        let config = VnaConfig::load_from(dir.path().join("absent.toml"));
        std::env::remove_var("RUST_VNA_BRIDGE__GPIB_ADDRESS");
        std::env::remove_var("RUST_VNA_APPLICATION__LOG_LEVEL");
        std::env::remove_var("RUST_VNA_APPLICATION__LOG_FORMAT");

        let config = config.unwrap();
        assert_eq!(config.bridge.gpib_address, 5);
        assert_eq!(config.application.log_level, "trace");
        assert_eq!(config.application.log_format, LogFormat::Pretty);
    }

    #[test]
    fn invalid_log_level() {
        let mut config = VnaConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(matches!(
            config.validate(),
            Err(VnaError::Configuration(_))
        ));
    }

    #[test]
    fn gpib_address_out_of_range() {
        let mut config = VnaConfig::default();
        config.bridge.gpib_address = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_response_timeout_rejected() {
        let mut config = VnaConfig::default();
        config.protocol.response_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sweep_parameters_are_validated() {
        let mut config = VnaConfig::default();
        config.sweep.stop_hz = 600_000_000;
        assert!(matches!(
            config.validate(),
            Err(VnaError::Configuration(_))
        ));
    }
}
