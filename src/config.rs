//! Engine configuration
//!
//! All timing knobs of the engine live in `EngineConfig`. Every field has a
//! default, so a config file only needs to list what it overrides. Durations
//! are stored as milliseconds in JSON.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Serde adapter writing a `Duration` as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Time-to-live for each resource class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Market list and reserve rates
    #[serde(with = "duration_ms")]
    pub markets: Duration,
    /// Protocol-wide analytics
    #[serde(with = "duration_ms")]
    pub analytics: Duration,
    /// Per-wallet supplied and borrowed positions
    #[serde(with = "duration_ms")]
    pub positions: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            markets: Duration::from_secs(30),
            analytics: Duration::from_secs(45),
            positions: Duration::from_secs(20),
        }
    }
}

/// Configuration for the synchronization engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Remote endpoints in preference order (first = rank 0)
    pub endpoints: Vec<String>,
    /// Cache TTLs per resource class
    pub ttl: TtlConfig,
    /// Interval between scheduled endpoint probes
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Upper bound for a single probe round
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
    /// Total attempts per fetch, including the first one
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    /// Upper bound for any retry delay
    #[serde(with = "duration_ms")]
    pub retry_cap_delay: Duration,
    /// Quiet period after an identity change before positions are fetched
    #[serde(with = "duration_ms")]
    pub debounce_window: Duration,
    /// Minimum spacing between two issued fetches of the same key
    #[serde(with = "duration_ms")]
    pub min_fetch_interval: Duration,
    /// Minimum spacing between two accepted manual refreshes
    #[serde(with = "duration_ms")]
    pub manual_refresh_rate_limit: Duration,
    /// Periodic refresh cadence while the connection is healthy
    #[serde(with = "duration_ms")]
    pub healthy_refresh_interval: Duration,
    /// Periodic refresh cadence while the connection is degraded
    #[serde(with = "duration_ms")]
    pub degraded_refresh_interval: Duration,
    /// How long an error stays visible before it is cleared automatically
    #[serde(with = "duration_ms")]
    pub error_display_duration: Duration,
    /// Consecutive failed fetch cycles before the connection counts as unhealthy
    pub unhealthy_after_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://api.mainnet-beta.solana.com".to_string(),
                "https://solana-api.projectserum.com".to_string(),
            ],
            ttl: TtlConfig::default(),
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_cap_delay: Duration::from_secs(8),
            debounce_window: Duration::from_secs(2),
            min_fetch_interval: Duration::from_secs(1),
            manual_refresh_rate_limit: Duration::from_secs(5),
            healthy_refresh_interval: Duration::from_secs(15),
            degraded_refresh_interval: Duration::from_secs(60),
            error_display_duration: Duration::from_secs(8),
            unhealthy_after_failures: 3,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a JSON file
    ///
    /// A missing file is not an error: defaults are returned instead. Values
    /// are not checked here so overrides can be merged first; call
    /// `validate` on the final configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one endpoint is required".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1".to_string(),
            ));
        }
        let timers = [
            ("health_check_interval", self.health_check_interval),
            ("health_check_timeout", self.health_check_timeout),
            ("healthy_refresh_interval", self.healthy_refresh_interval),
            ("degraded_refresh_interval", self.degraded_refresh_interval),
            ("retry_base_delay", self.retry_base_delay),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.retry_cap_delay < self.retry_base_delay {
            return Err(ConfigError::Invalid(
                "retry_cap_delay must not be below retry_base_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the XDG-compliant default config path (`~/.config/lendsync/config.json` on Linux)
///
/// Returns `None` if no home directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "lendsync")?;
    Some(project_dirs.config_dir().join("config.json"))
}
