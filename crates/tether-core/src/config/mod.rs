//! Configuration management for Tether.
//!
//! This module handles loading, saving, and managing Tether configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/tether/config.toml` |
//! | macOS | `~/Library/Application Support/dev.tether.Tether/config.toml` |
//! | Windows | `%APPDATA%\tether\Tether\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Flush threshold: {}", config.sync.flush_threshold);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for Tether.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sync loop settings
    pub sync: SyncSettings,
    /// Git snapshot settings
    pub git: GitSettings,
    /// Title generation settings
    pub title: TitleSettings,
}

/// Sync loop configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Master switch; when off, queued work is dropped instead of uploaded
    pub enabled: bool,
    /// Queue length above which a flush is triggered early
    pub flush_threshold: usize,
    /// Interval between periodic sync passes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_threshold: crate::DEFAULT_FLUSH_THRESHOLD,
            interval: Duration::from_secs(crate::DEFAULT_SYNC_INTERVAL_SECS),
        }
    }
}

/// Git snapshot configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Capture and upload git state during sync
    pub enabled: bool,
    /// Patches larger than this are dropped (metadata is kept)
    pub max_patch_bytes: usize,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_patch_bytes: crate::DEFAULT_MAX_PATCH_BYTES,
        }
    }
}

/// Title generation configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleSettings {
    /// Time allowed for the host completion
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// First-message characters included in the prompt
    pub max_prompt_chars: usize,
}

impl Default for TitleSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TITLE_TIMEOUT_SECS),
            max_prompt_chars: 1000,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tether", "Tether")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
