//! Bench configuration using Figment.
//!
//! Configuration is loaded from, in increasing precedence:
//! 1. built-in defaults
//! 2. a TOML file (`cryo_bench.toml` unless another path is given)
//! 3. environment variables prefixed with `CRYOBENCH_`, with `__` separating
//!    nested keys
//!
//! ```text
//! CRYOBENCH_LOGGING__LEVEL=debug
//! CRYOBENCH_MOTION__BACKEND=simulated
//! CRYOBENCH_MOTION__ADDRESS=192.168.1.40:23
//! CRYOBENCH_SAMPLING__MIN_S=10
//! ```
//!
//! # Example file
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [motion]
//! backend = "tcp"
//! address = "192.168.1.40:23"
//! io_timeout = "2s"
//!
//! [motion.kinematics]
//! xy_speed = 20.0
//! z_speed = 10.0
//! poll_interval = "100ms"
//!
//! [sampling]
//! min_s = 5
//! std_err = 0.01
//! timeout = "5s"
//!
//! [scan]
//! scan_start = [-40.0, -40.0]
//! scan_stop = [40.0, 40.0]
//! resolution = 0.5
//! center = { x = 0.0, y = 0.0, z = 0.0 }
//! center_power_interval = "10m"
//!
//! [[plan]]
//! rf_ghz = 231.0
//! lo_ghz = 225.0
//! ```

use crate::motion::MotionSettings;
use crate::sampling::SamplingConfig;
use crate::scan::{ScanGeometry, ScanItem};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "cryo_bench.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CRYOBENCH_";

/// Failure to load or validate a [`BenchConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or an environment override could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Parsed, but a value is outside what the bench accepts.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Complete bench configuration: defaults, then the TOML file, then
/// `CRYOBENCH_` environment overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Log level and output format.
    pub logging: LoggingConfig,
    /// Motion stage backend and kinematics.
    pub motion: MotionConfig,
    /// Averaging used by the center-power check and the `sample` command.
    pub sampling: SamplingConfig,
    /// Raster geometry shared by every plan item.
    pub scan: ScanGeometry,
    /// Plan items, in execution order.
    pub plan: Vec<ScanItem>,
}

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, with ANSI colors.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    pub level: String,
    /// Pretty or JSON lines.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Which stage implementation [`crate::motion::connect`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionBackend {
    /// The real controller over TCP.
    #[default]
    Tcp,
    /// The in-process simulated stage.
    Simulated,
}

/// `[motion]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Real controller or simulation.
    pub backend: MotionBackend,
    /// host:port of the motion controller.
    pub address: String,
    /// Per-exchange read/write timeout on the controller link.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Speeds, accelerations and unit conversions pushed on connect.
    pub kinematics: MotionSettings,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            backend: MotionBackend::Tcp,
            address: "127.0.0.1:23".to_string(),
            io_timeout: Duration::from_secs(2),
            kinematics: MotionSettings::default(),
        }
    }
}

impl BenchConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from `path` and the environment. A missing file is not an error;
    /// defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.motion.backend == MotionBackend::Tcp && self.motion.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "motion.address cannot be empty for the tcp backend".to_string(),
            ));
        }
        if self.motion.io_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "motion.io_timeout must be non-zero".to_string(),
            ));
        }
        self.motion
            .kinematics
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("motion.kinematics: {}", e)))?;

        if self.sampling.std_err < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "sampling.std_err must not be negative, got {}",
                self.sampling.std_err
            )));
        }

        self.scan
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("scan: {}", e)))?;

        for (i, item) in self.plan.iter().enumerate() {
            if !(item.rf_ghz > 0.0 && item.lo_ghz > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "plan item {}: RF and LO must be positive (got {} / {} GHz)",
                    i, item.rf_ghz, item.lo_ghz
                )));
            }
        }
        Ok(())
    }

    /// Plan items with `enable` set, in order.
    pub fn enabled_items(&self) -> impl Iterator<Item = &ScanItem> {
        self.plan.iter().filter(|item| item.enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let config = BenchConfig::load_from("/nonexistent/cryo_bench.toml").unwrap();
        assert_eq!(config, BenchConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [motion]
            backend = "simulated"
            io_timeout = "500ms"

            [motion.kinematics]
            xy_speed = 10
            poll_interval = "50ms"

            [sampling]
            min_s = 4
            std_err = 0.02
            timeout = "3s"

            [scan]
            scan_start = [-10.0, -5.0]
            scan_stop = [10.0, 5.0]
            resolution = 1.0
            center = { x = 0.0, y = 0.0, z = 0.0 }
            center_power_interval = "5m"

            [[plan]]
            rf_ghz = 231.0
            lo_ghz = 225.0

            [[plan]]
            enable = false
            rf_ghz = 243.0
            lo_ghz = 237.0
            "#,
        );
        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.motion.backend, MotionBackend::Simulated);
        assert_eq!(config.motion.io_timeout, Duration::from_millis(500));
        assert_eq!(config.motion.kinematics.xy_speed, 10.0);
        assert_eq!(config.motion.kinematics.z_steps_per_deg, 225.0);
        assert_eq!(config.sampling.timeout, Duration::from_secs(3));
        assert_eq!(config.scan.center_power_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.plan.len(), 2);
        assert_eq!(config.enabled_items().count(), 1);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[logging]\nlevel = \"warn\"\n");
        std::env::set_var("CRYOBENCH_LOGGING__LEVEL", "trace");
        std::env::set_var("CRYOBENCH_MOTION__ADDRESS", "10.0.0.7:23");
        let result = BenchConfig::load_from(file.path());
        std::env::remove_var("CRYOBENCH_LOGGING__LEVEL");
        std::env::remove_var("CRYOBENCH_MOTION__ADDRESS");

        let config = result.unwrap();
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.motion.address, "10.0.0.7:23");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BenchConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_kinematics_out_of_bounds() {
        let mut config = BenchConfig::default();
        config.motion.kinematics.xy_speed = 80.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("XY speed"));
    }

    #[test]
    fn test_invalid_plan_item() {
        let mut config = BenchConfig::default();
        config.plan.push(ScanItem::new(0.0, 95.0));
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_load_error() {
        let file = write_config("[motion]\nbackend = \"carrier-pigeon\"\n");
        assert!(matches!(
            BenchConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }
}
