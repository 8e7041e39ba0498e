//! Configuration file support.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/dosing/config.toml`. Every
//! field has a default, so a missing file or a partial file is valid.

use crate::log::SyncSettings;
use crate::{Error, GlucoseUnits, Result, MANUAL_ORIGIN};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub units: UnitsConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// How long live events are kept
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_window_hours")]
    pub live_window_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            live_window_hours: default_window_hours(),
        }
    }
}

/// Upload cursor parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_window_hours")]
    pub lookback_hours: i64,

    #[serde(default = "default_manual_tag")]
    pub manual_tag: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_window_hours(),
            manual_tag: default_manual_tag(),
        }
    }
}

/// Units producers enter glucose values in
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct UnitsConfig {
    #[serde(default)]
    pub glucose: GlucoseUnits,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(std::env::temp_dir)
    });
    base.join("dosing")
}

fn default_window_hours() -> i64 {
    24
}

fn default_manual_tag() -> String {
    MANUAL_ORIGIN.to_string()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(std::env::temp_dir)
        });
        base.join("dosing").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.live_window_hours <= 0 {
            return Err(Error::Config(format!(
                "retention.live_window_hours must be positive, got {}",
                self.retention.live_window_hours
            )));
        }
        if self.sync.lookback_hours < 0 {
            return Err(Error::Config(format!(
                "sync.lookback_hours must not be negative, got {}",
                self.sync.lookback_hours
            )));
        }
        check_hours("retention.live_window_hours", self.retention.live_window_hours)?;
        check_hours("sync.lookback_hours", self.sync.lookback_hours)?;
        if self.sync.manual_tag.trim().is_empty() {
            return Err(Error::Config("sync.manual_tag must not be empty".into()));
        }
        Ok(())
    }

    /// Retention window of live streams. Call `validate` first; an out of
    /// range value saturates instead of panicking.
    pub fn live_window(&self) -> Duration {
        hours_saturating(self.retention.live_window_hours)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            manual_tag: self.sync.manual_tag.clone(),
            lookback: hours_saturating(self.sync.lookback_hours),
        }
    }
}

/// Upper bound for every hour-valued setting: ten years
pub const MAX_HOURS: i64 = 10 * 365 * 24;

fn check_hours(field: &str, hours: i64) -> Result<()> {
    if hours > MAX_HOURS || Duration::try_hours(hours).is_none() {
        return Err(Error::Config(format!(
            "{} must be at most {}, got {}",
            field, MAX_HOURS, hours
        )));
    }
    Ok(())
}

fn hours_saturating(hours: i64) -> Duration {
    Duration::try_hours(hours).unwrap_or(if hours < 0 { Duration::MIN } else { Duration::MAX })
}
