//! Configuration for the sync layer
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file,
//! then `REPSYNC_<SECTION>_<KEY>` environment variables.

use crate::flush::engine::FlushConfig;
use crate::logging::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::{ConfigError, ConfigResult};

pub const ENV_PREFIX: &str = "REPSYNC";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Flush and trigger tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Items per remote call
    pub batch_size: usize,

    /// Delivery attempts before an item is dropped
    pub max_attempts: u32,

    /// Periodic flush interval
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// How long done/error stay visible
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding the queue
    pub queue_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the backing service
    pub base_url: Option<String>,

    /// Transport timeout; a timeout counts as a failed batch
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How often reachability is probed
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let flush = FlushConfig::default();
        Self {
            batch_size: flush.batch_size,
            max_attempts: flush.max_attempts,
            flush_interval: flush.flush_interval,
            debounce: flush.debounce,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from("./data/queue.json"),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_duration(key: &str, raw: &str) -> ConfigResult<Duration> {
    humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|e| {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }
    })
}

impl Config {
    /// Defaults overridden by `REPSYNC_*` environment variables
    ///
    /// Example: `REPSYNC_SYNC_BATCH_SIZE=10`, `REPSYNC_SYNC_FLUSH_INTERVAL=30s`
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// File if given, defaults otherwise, then environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REPSYNC_<SECTION>_<KEY>` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, key: &str| {
            let name = format!("{}_{}_{}", ENV_PREFIX, section, key);
            lookup(&name).map(|value| (name, value))
        };

        if let Some((k, v)) = var("SYNC", "BATCH_SIZE") {
            self.sync.batch_size = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = var("SYNC", "MAX_ATTEMPTS") {
            self.sync.max_attempts = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = var("SYNC", "FLUSH_INTERVAL") {
            self.sync.flush_interval = parse_duration(&k, &v)?;
        }
        if let Some((k, v)) = var("SYNC", "DEBOUNCE") {
            self.sync.debounce = parse_duration(&k, &v)?;
        }

        if let Some((_, v)) = var("STORE", "QUEUE_PATH") {
            self.store.queue_path = PathBuf::from(v);
        }

        if let Some((_, v)) = var("REMOTE", "BASE_URL") {
            self.remote.base_url = Some(v);
        }
        if let Some((k, v)) = var("REMOTE", "REQUEST_TIMEOUT") {
            self.remote.request_timeout = parse_duration(&k, &v)?;
        }
        if let Some((k, v)) = var("REMOTE", "POLL_INTERVAL") {
            self.remote.poll_interval = parse_duration(&k, &v)?;
        }

        if let Some((_, v)) = var("LOG", "LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some((k, v)) = var("LOG", "JSON") {
            self.logging.json_format = parse_value(&k, &v)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.sync.flush_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "flush_interval must be greater than 0".to_string(),
            ));
        }

        if self.remote.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if LogLevel::from_str(&self.logging.level).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            batch_size: self.sync.batch_size,
            max_attempts: self.sync.max_attempts,
            debounce: self.sync.debounce,
            flush_interval: self.sync.flush_interval,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let level = LogLevel::from_str(&self.logging.level).unwrap_or_default();
        LogConfig::new(level)
            .with_timestamp(self.logging.with_timestamp)
            .with_target(self.logging.with_target)
            .json_format(self.logging.json_format)
    }
}
