//! TOML-based configuration for the session manager.
//!
//! Reads and writes [`SessionConfig`] from the platform-appropriate file:
//! - Linux:    `~/.config/carlink/config.toml`
//! - macOS:    `~/Library/Application Support/Carlink/config.toml`
//! - Windows:  `%APPDATA%\Carlink\config.toml`
//!
//! Example:
//!
//! ```toml
//! [session]
//! log_level = "debug"
//! reconnect_on_start = true
//!
//! [storage]
//! active_user = 10
//!
//! [[devices]]
//! device_id = "5c1a7e0e-phone"
//! name = "Driver's Pixel"
//! user = 10
//! ```
//!
//! Every field has a serde default so a partial (or missing) file still
//! yields a working configuration.

use std::path::{Path, PathBuf};

use carlink_core::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::UserId;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// Seed associations for the in-memory storage.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Runtime behaviour of the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// `tracing` filter directive, e.g. `"info"` or `"carlink_session=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Attempt to link the active user's device as soon as the service starts.
    #[serde(default = "default_true")]
    pub reconnect_on_start: bool,
}

/// Settings for the storage adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    /// The OS user considered to be in the foreground at start-up.
    #[serde(default = "default_active_user")]
    pub active_user: UserId,
}

/// One associated device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_active_user")]
    pub user: UserId,
    #[serde(default = "default_true")]
    pub connection_enabled: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_active_user() -> UserId {
    10
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            reconnect_on_start: default_true(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            active_user: default_active_user(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the platform config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config from the platform location, writing a default file
/// there first if none exists yet.
///
/// # Errors
///
/// See [`load_or_create_config_at`].
pub fn load_or_create_config() -> Result<SessionConfig, ConfigError> {
    load_or_create_config_at(&config_file_path()?)
}

/// Loads the config from `path`, creating it with default contents (and any
/// missing parent directories) when the file is absent.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the default file cannot be written, plus
/// anything [`load_config_from`] returns.
pub fn load_or_create_config_at(path: &Path) -> Result<SessionConfig, ConfigError> {
    if !path.exists() {
        save_config_to(path, &SessionConfig::default())?;
    }
    load_config_from(path)
}

/// Loads the config from `path`, returning defaults if the file is absent.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<SessionConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &SessionConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Carlink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("carlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Carlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
