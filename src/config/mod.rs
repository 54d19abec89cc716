//! Runner configuration.
//!
//! Loaded from an optional TOML file, then environment variables prefixed with
//! `DAQROC_` (for example `DAQROC_USE_HARDWARE=true`). Missing keys take the
//! defaults below.
use std::path::{Path, PathBuf};
use std::time::Duration;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::queue::QueueSettings;
use crate::serial::interface::{AUTO_PORT, DEFAULT_BAUD_RATE};
use crate::serial::{LinkOptions, ReconnectPolicy};

pub const ENV_PREFIX: &str = "DAQROC_";
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Serial device path, or `auto` for the first attached Teensy
    #[serde(alias = "serialPath")]
    pub serial_path: String,
    #[serde(alias = "baudRate")]
    pub baud_rate: u32,
    /// Drive the real controller instead of the simulator
    #[serde(alias = "useHardware")]
    pub use_hardware: bool,
    #[serde(alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    #[serde(alias = "runTimeoutMs")]
    pub run_timeout_ms: u64,
    pub beacon_interval_ms: u64,
    pub write_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_interval_ms: u64,
    /// Artifacts land in `<tests_root>/<username>/`
    pub tests_root: PathBuf,
    /// JSON file backing the test records; in-memory when unset
    pub store_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            serial_path: AUTO_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            use_hardware: false,
            poll_interval_ms: 5_000,
            run_timeout_ms: 30 * 60 * 1_000,
            beacon_interval_ms: 5_000,
            write_timeout_ms: 2_000,
            reconnect_interval_ms: 1_000,
            reconnect_max_interval_ms: 30_000,
            tests_root: PathBuf::from("tests"),
            store_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Defaults plus environment only
    pub fn load() -> Result<Self> {
        Self::from_figment(Figment::new().merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Defaults, then the TOML file at `path` if it exists, then environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level '{}' must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".to_string()));
        }
        if self.serial_path.trim().is_empty() {
            return Err(ConfigError::Invalid("serial_path must not be empty".to_string()));
        }

        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("run_timeout_ms", self.run_timeout_ms),
            ("beacon_interval_ms", self.beacon_interval_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("reconnect_max_interval_ms", self.reconnect_max_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.reconnect_max_interval_ms < self.reconnect_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_max_interval_ms ({}) is below reconnect_interval_ms ({})",
                self.reconnect_max_interval_ms, self.reconnect_interval_ms
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reconnect_max_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_interval_ms)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            write_timeout: self.write_timeout(),
            reconnect: ReconnectPolicy {
                initial: self.reconnect_interval(),
                max: self.reconnect_max_interval(),
            },
            ..Default::default()
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            tests_root: self.tests_root.clone(),
            run_timeout: self.run_timeout(),
            poll_interval: self.poll_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RunnerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial_path, "auto");
        assert_eq!(config.run_timeout(), Duration::from_secs(1800));
        assert!(!config.use_hardware);
    }

    #[test]
    fn rejects_bad_values() {
        let config = RunnerConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunnerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunnerConfig {
            reconnect_interval_ms: 5_000,
            reconnect_max_interval_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_accepts_camel_case_names() {
        let config: RunnerConfig = Figment::new()
            .merge(Toml::string(
                r#"
                serialPath = "/dev/ttyACM0"
                useHardware = true
                run_timeout_ms = 60000
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(config.serial_path, "/dev/ttyACM0");
        assert!(config.use_hardware);
        assert_eq!(config.run_timeout_ms, 60_000);
        assert_eq!(config.baud_rate, 115_200);
    }
}
