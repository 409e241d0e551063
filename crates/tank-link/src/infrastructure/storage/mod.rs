//! Storage infrastructure: configuration file and last-device persistence.
//!
//! - `config` reads/writes the TOML settings file and turns it into the
//!   runtime settings of the connection manager and scanner.
//! - `last_device` remembers which controller we talked to last.

pub mod config;
pub mod last_device;

pub use config::{
    config_file_path, load_config, load_config_from, save_config, save_config_to, AppConfig,
    ConfigError,
};
pub use last_device::{DeviceStore, FileDeviceStore, MemoryDeviceStore, StoreError};
