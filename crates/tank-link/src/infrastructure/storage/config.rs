//! TOML-based configuration for tank-link.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Windows:  `%APPDATA%\TankLink\config.toml`
//! - Linux:    `~/.config/tanklink/config.toml`
//! - macOS:    `~/Library/Application Support/TankLink/config.toml`
//!
//! A missing file means "all defaults", and every field carries a
//! `#[serde(default = ...)]`, so a file only needs the values it changes:
//!
//! ```toml
//! [device]
//! max_reconnect_attempts = 10
//!
//! [scan]
//! quick_candidates = ["192.168.1.50"]
//! ```
//!
//! Values are validated on load; a config that would produce a zero-sized
//! scan batch or a backoff whose base exceeds its cap is rejected with
//! [`ConfigError::Invalid`] rather than silently adjusted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tank_core::{MessageEnvelope, PolicyError, ReconnectPolicy, DEFAULT_PORT};

use crate::infrastructure::network::{HeartbeatConfig, LinkConfig, ScanConfig};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The reconnect settings do not form a valid policy.
    #[error("invalid reconnect settings: {0}")]
    Policy(#[from] PolicyError),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub scan: ScanSettings,
}

/// How to reach and keep the device link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Controller WebSocket port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reconnect automatically after unintentional closes.
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_interval_ms")]
    pub reconnect_base_interval_ms: u64,
    #[serde(default = "default_reconnect_max_interval_ms")]
    pub reconnect_max_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Probe the device before every handshake.
    #[serde(default)]
    pub preflight_probe: bool,
    /// Send `handshake` + `getAllData` whenever the link comes up.
    #[serde(default = "default_true")]
    pub sync_on_connect: bool,
}

/// Liveness probing while connected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_heartbeat_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Message type sent as the probe.
    #[serde(default = "default_probe_type")]
    pub probe_type: String,
}

/// Discovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_quick_concurrency")]
    pub quick_concurrency: usize,
    #[serde(default = "default_quick_candidates")]
    pub quick_candidates: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_interval_ms() -> u64 {
    1000
}
fn default_reconnect_max_interval_ms() -> u64 {
    30_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_grace_ms() -> u64 {
    2000
}
fn default_miss_threshold() -> u32 {
    2
}
fn default_probe_type() -> String {
    tank_core::message_types::GET_SYSTEM_STATUS_TEXT.to_string()
}
fn default_batch_size() -> usize {
    20
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_quick_concurrency() -> usize {
    4
}
fn default_quick_candidates() -> Vec<String> {
    vec![
        "192.168.4.1".to_string(),
        "192.168.1.100".to_string(),
        "192.168.0.100".to_string(),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            scan: ScanSettings::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            reconnect: default_true(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_interval_ms: default_reconnect_base_interval_ms(),
            reconnect_max_interval_ms: default_reconnect_max_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            preflight_probe: false,
            sync_on_connect: default_true(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_heartbeat_interval_ms(),
            grace_ms: default_heartbeat_grace_ms(),
            miss_threshold: default_miss_threshold(),
            probe_type: default_probe_type(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            probe_timeout_ms: default_probe_timeout_ms(),
            quick_concurrency: default_quick_concurrency(),
            quick_candidates: default_quick_candidates(),
        }
    }
}

// ── Validation and conversion ─────────────────────────────────────────────────

impl AppConfig {
    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] or [`ConfigError::Policy`] for the
    /// first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.port == 0 {
            return Err(ConfigError::Invalid("device.port must not be 0".into()));
        }
        if self.device.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "device.handshake_timeout_ms must be at least 1".into(),
            ));
        }
        if self.heartbeat.enabled {
            if self.heartbeat.interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "heartbeat.interval_ms must be at least 1".into(),
                ));
            }
            if self.heartbeat.miss_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "heartbeat.miss_threshold must be at least 1".into(),
                ));
            }
            if self.heartbeat.probe_type.is_empty() {
                return Err(ConfigError::Invalid(
                    "heartbeat.probe_type must not be empty".into(),
                ));
            }
        }
        if self.scan.batch_size == 0 {
            return Err(ConfigError::Invalid("scan.batch_size must be at least 1".into()));
        }
        if self.scan.quick_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scan.quick_concurrency must be at least 1".into(),
            ));
        }
        if self.scan.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scan.probe_timeout_ms must be at least 1".into(),
            ));
        }
        self.reconnect_policy()?;
        Ok(())
    }

    /// The backoff policy described by `[device]`.
    pub fn reconnect_policy(&self) -> Result<ReconnectPolicy, PolicyError> {
        ReconnectPolicy::new(
            Duration::from_millis(self.device.reconnect_base_interval_ms),
            Duration::from_millis(self.device.reconnect_max_interval_ms),
            self.device.max_reconnect_attempts,
        )
    }

    /// Connection manager settings.
    pub fn link_config(&self) -> Result<LinkConfig, ConfigError> {
        let heartbeat = self.heartbeat.enabled.then(|| HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            grace: Duration::from_millis(self.heartbeat.grace_ms),
            miss_threshold: self.heartbeat.miss_threshold,
            probe: MessageEnvelope::new(self.heartbeat.probe_type.clone()),
        });

        Ok(LinkConfig {
            reconnect: self.device.reconnect,
            policy: self.reconnect_policy()?,
            handshake_timeout: Duration::from_millis(self.device.handshake_timeout_ms),
            preflight_timeout: self
                .device
                .preflight_probe
                .then(|| Duration::from_millis(self.scan.probe_timeout_ms)),
            heartbeat,
        })
    }

    /// Scanner settings.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            batch_size: self.scan.batch_size,
            probe_timeout: Duration::from_millis(self.scan.probe_timeout_ms),
            port: self.device.port,
            quick_candidates: self.scan.quick_candidates.clone(),
            quick_concurrency: self.scan.quick_concurrency,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for tank-link files.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the platform location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads and validates the config at `path`, returning defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`]/[`ConfigError::Policy`] if validation fails.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Persists `config` to the platform location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory including the app subdirectory.
pub(crate) fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("TankLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("tanklink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("TankLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
