//! Framework configuration.
//!
//! All sections deserialize with per-field defaults so a partial (or
//! empty) JSON document yields a fully usable configuration. Durations
//! are expressed in milliseconds on the wire.

use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            manager: ManagerConfig::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let file = File::open(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            message: e.to_string(),
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }
}

/// Settings for the resource manager's bulk lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of resources initialized at the same time.
    #[serde(default = "default_startup_concurrency")]
    pub startup_concurrency: usize,

    /// Global bound on `stop_all_resources`.
    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    #[serde(default = "default_health_check_interval", with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_concurrency: default_startup_concurrency(),
            shutdown_timeout: default_shutdown_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Settings for one connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// Connections pre-warmed on `start`.
    #[serde(default)]
    pub min_size: usize,

    #[serde(default = "default_max_idle_time", with = "duration_ms")]
    pub max_idle_time: Duration,

    #[serde(default = "default_acquire_timeout", with = "duration_ms")]
    pub acquire_timeout: Duration,

    #[serde(default = "default_maintenance_interval", with = "duration_ms")]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            min_size: 0,
            max_idle_time: default_max_idle_time(),
            acquire_timeout: default_acquire_timeout(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

/// Settings for one circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_reset_timeout", with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

fn default_app_name() -> String {
    "chassis".to_string()
}

fn default_startup_concurrency() -> usize {
    5
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_pool_max_size() -> usize {
    10
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(300)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_failures() -> u32 {
    3
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
