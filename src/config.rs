//! Configuration for referral-core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("referral-core")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and config file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long a transaction waits for the database write lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Period of the admin pool refresh task
    #[serde(default = "default_pool_refresh_interval")]
    pub pool_refresh_interval_secs: u64,

    /// Safety cap on inviter-chain walks (not a business rule)
    #[serde(default = "default_max_ancestor_walk")]
    pub max_ancestor_walk: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub bonus: BonusConfig,
}

/// Backoff settings for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Per-level referral bonus rates in basis points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusConfig {
    /// Rates for levels 1..=4
    #[serde(default = "default_level_rates")]
    pub level_rates_bps: [u32; 4],

    /// Separate schedule for task earnings; falls back to `level_rates_bps`
    #[serde(default)]
    pub task_level_rates_bps: Option<[u32; 4]>,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_refresh_interval() -> u64 {
    300
}

fn default_max_ancestor_walk() -> usize {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_level_rates() -> [u32; 4] {
    [2_000, 1_000, 500, 200]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            level_rates_bps: default_level_rates(),
            task_level_rates_bps: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_refresh_interval_secs: default_pool_refresh_interval(),
            max_ancestor_walk: default_max_ancestor_walk(),
            retry: RetryConfig::default(),
            bonus: BonusConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_ancestor_walk < 4 {
            return Err(EngineError::Config(
                "max_ancestor_walk must cover the 4-level bonus horizon".into(),
            ));
        }
        if self.pool_refresh_interval_secs == 0 {
            return Err(EngineError::Config("pool_refresh_interval_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        let schedules = std::iter::once(&self.bonus.level_rates_bps)
            .chain(self.bonus.task_level_rates_bps.iter());
        for rates in schedules {
            if rates.iter().any(|bps| *bps > 10_000) {
                return Err(EngineError::Config(format!("Bonus rate above 100%: {:?}", rates)));
            }
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("engine.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn pool_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pool_refresh_interval_secs)
    }
}
