//! "Last known device" persistence.
//!
//! The coordinator remembers the endpoint of the last successful connection
//! so the next launch can reconnect without scanning.  Storage is a
//! strategy injected at construction: [`FileDeviceStore`] for the binary,
//! [`MemoryDeviceStore`] for tests and embedders that keep state elsewhere.
//!
//! The file is a two-line TOML document next to `config.toml`:
//!
//! ```toml
//! host = "192.168.1.100"
//! port = 81
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use tank_core::DeviceEndpoint;

use super::config::platform_config_dir;

/// Error type for device store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse stored device: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize device: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Reads and writes the last successfully connected endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceStore: Send + Sync {
    /// Returns the stored endpoint, or `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<DeviceEndpoint>, StoreError>;

    /// Replaces the stored endpoint.  May block on file I/O; callers on an
    /// async task run it through `spawn_blocking`.
    fn save(&self, endpoint: &DeviceEndpoint) -> Result<(), StoreError>;
}

// ── File store ────────────────────────────────────────────────────────────────

/// Stores the endpoint as TOML at a fixed path.
#[derive(Debug, Clone)]
pub struct FileDeviceStore {
    path: PathBuf,
}

impl FileDeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `last_device.toml` in the platform config directory.
    pub fn in_config_dir() -> Result<Self, StoreError> {
        platform_config_dir()
            .map(|dir| Self::new(dir.join("last_device.toml")))
            .ok_or(StoreError::NoPlatformConfigDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for FileDeviceStore {
    fn load(&self) -> Result<Option<DeviceEndpoint>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, endpoint: &DeviceEndpoint) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string(endpoint)?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

// ── Memory store ──────────────────────────────────────────────────────────────

/// Keeps the endpoint in memory only.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    slot: Mutex<Option<DeviceEndpoint>>,
}

impl MemoryDeviceStore {
    pub fn new(initial: Option<DeviceEndpoint>) -> Self {
        Self {
            slot: Mutex::new(initial),
        }
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn load(&self) -> Result<Option<DeviceEndpoint>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, endpoint: &DeviceEndpoint) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
