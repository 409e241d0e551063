//! TankLink command-line client.
//!
//! A small operator tool around the `tank_link` library: find water-tank
//! controllers on the LAN, hold a resilient link to one of them, or send a
//! single command.
//!
//! # Usage
//!
//! ```text
//! tank-link [OPTIONS] <COMMAND>
//!
//! Commands:
//!   scan         Probe every host of a /24 (e.g. --prefix 192.168.1)
//!   quick-scan   Probe the well-known addresses and the last device
//!   connect      Hold a link open and print every message until Ctrl+C
//!   send         Connect, send one message, print replies, disconnect
//!   write-config Save the effective settings (file plus flags) as TOML
//!
//! Options:
//!   --config <PATH>              Config file [default: platform config dir]
//!   --port <PORT>                Device WebSocket port
//!   --no-reconnect               Give up after the first failure
//!   --batch-size <N>             Concurrent probes per scan batch
//!   --probe-timeout-ms <MS>      Per-probe timeout
//! ```
//!
//! # Configuration precedence
//!
//! Built-in defaults, then the TOML config file, then these flags.  Every
//! flag can also be set through a `TANKLINK_*` environment variable.
//!
//! # Logging
//!
//! `RUST_LOG` wins when set (e.g. `RUST_LOG=tank_link=debug`); otherwise the
//! config file's `log_level` is used.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tank_core::{encode, ConnectionState, InboundMessage, MessageEnvelope};
use tank_link::application::SyncCoordinator;
use tank_link::infrastructure::network::{ScanCancel, ScanProgress, ScanResult, WsConnector};
use tank_link::infrastructure::storage::{
    config_file_path, load_config, load_config_from, save_config, save_config_to, AppConfig,
    DeviceStore, FileDeviceStore, MemoryDeviceStore,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// TankLink: discovery and resilient WebSocket link for water-tank controllers.
#[derive(Debug, Parser)]
#[command(
    name = "tank-link",
    about = "Discover and talk to ESP32 water-tank controllers over WebSocket",
    version
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, env = "TANKLINK_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket port of the device (overrides `device.port`).
    #[arg(long, global = true, env = "TANKLINK_PORT")]
    port: Option<u16>,

    /// Do not reconnect after an unintentional close.
    #[arg(long, global = true)]
    no_reconnect: bool,

    /// Probes run concurrently per scan batch (overrides `scan.batch_size`).
    #[arg(long, global = true, env = "TANKLINK_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Per-probe timeout in milliseconds (overrides `scan.probe_timeout_ms`).
    #[arg(long, global = true, env = "TANKLINK_PROBE_TIMEOUT_MS")]
    probe_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe hosts 1-254 of a /24 network.
    Scan {
        /// First three octets of the network, e.g. `192.168.1`.
        #[arg(long, default_value = "192.168.1")]
        prefix: String,
    },

    /// Probe the last device and the well-known default addresses.
    QuickScan,

    /// Hold a link open and print every inbound message until Ctrl+C.
    ///
    /// Without HOST, reconnects to the last device or quick-scans for one.
    Connect {
        /// `host`, `host:port`, or `ws://host:port/`.
        host: Option<String>,
    },

    /// Send one message and print the replies that arrive within `--wait-ms`.
    Send {
        host: String,
        /// Message type, e.g. `getAllData` or `motor1On`.
        kind: String,
        /// Extra fields as a JSON object, e.g. `'{"level":40}'`.
        #[arg(long)]
        payload: Option<String>,
        /// How long to wait for the link and for replies.
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },

    /// Write the effective settings back to the config file.
    WriteConfig,
}

impl Cli {
    /// Applies the command-line overrides on top of `config` and
    /// re-validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if an override produces an invalid configuration
    /// (for example `--batch-size 0`).
    fn apply_overrides(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            config.device.port = port;
        }
        if self.no_reconnect {
            config.device.reconnect = false;
        }
        if let Some(batch_size) = self.batch_size {
            config.scan.batch_size = batch_size;
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.scan.probe_timeout_ms = ms;
        }
        config
            .validate()
            .context("invalid command-line override")?;
        Ok(())
    }

    /// Loads `--config`, or the platform config file when the flag is absent.
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load {}", path.display())),
            None => load_config().context("failed to load the platform config file"),
        }
    }

    /// Saves `config` where [`Cli::load_config`] reads it from and returns
    /// the path written.
    fn save_config(&self, config: &AppConfig) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => {
                save_config_to(config, path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Ok(path.clone())
            }
            None => {
                save_config(config).context("failed to write the platform config file")?;
                config_file_path().context("could not locate the config file")
            }
        }
    }

    /// `last_device.toml` next to the config file in use.
    fn device_store(&self) -> Arc<dyn DeviceStore> {
        match &self.config {
            Some(path) => sibling_device_store(path),
            None => match FileDeviceStore::in_config_dir() {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("{e}; last device will not be remembered");
                    Arc::new(MemoryDeviceStore::default())
                }
            },
        }
    }
}

/// Parses `--payload` into envelope fields.
fn parse_payload(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("--payload is not a JSON object: {text}")),
    }
}

/// `last_device.toml` next to `config_path`, or an in-memory store when no
/// directory can be determined.
fn sibling_device_store(config_path: &std::path::Path) -> Arc<dyn DeviceStore> {
    match config_path.parent() {
        Some(dir) => Arc::new(FileDeviceStore::new(dir.join("last_device.toml"))),
        None => {
            warn!(
                "no directory for {}; last device will not be remembered",
                config_path.display()
            );
            Arc::new(MemoryDeviceStore::default())
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed with `clap`.
/// 2. The config file is loaded (defaults when missing) and the CLI
///    overrides are applied.
/// 3. `tracing_subscriber` is initialised from `RUST_LOG` or the config's
///    `log_level`.
/// 4. A [`SyncCoordinator`] over the real WebSocket connector runs the
///    selected command.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = cli.load_config()?;
    cli.apply_overrides(&mut config)?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Command::WriteConfig = cli.command {
        let path = cli.save_config(&config)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let store = cli.device_store();
    let coordinator = SyncCoordinator::from_config(Arc::new(WsConnector), &config, store)
        .context("invalid link settings")?;

    match cli.command {
        Command::Scan { prefix } => run_scan(&coordinator, &prefix).await,
        Command::QuickScan => run_quick_scan(&coordinator).await,
        Command::Connect { host } => run_connect(&coordinator, host.as_deref()).await,
        Command::Send {
            host,
            kind,
            payload,
            wait_ms,
        } => {
            let envelope = MessageEnvelope::with_payload(kind, parse_payload(payload.as_deref())?);
            run_send(&coordinator, &host, &envelope, Duration::from_millis(wait_ms)).await
        }
        Command::WriteConfig => Ok(()),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Returns a cancel flag that is raised on Ctrl+C.
fn cancel_on_ctrl_c() -> ScanCancel {
    let cancel = ScanCancel::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping after the current batch");
                flag.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });
    cancel
}

fn print_result(result: &ScanResult) {
    if result.is_empty() {
        println!("no devices found ({} probed)", result.probed);
        return;
    }
    for endpoint in &result.endpoints {
        println!("{endpoint}");
    }
}

async fn run_scan(coordinator: &SyncCoordinator, prefix: &str) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (tx, mut rx) = mpsc::unbounded_channel::<ScanProgress>();
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            eprintln!("batch {}/{}: {} found", p.batch, p.total_batches, p.found);
        }
    });

    let result = coordinator
        .range_scan(prefix, &cancel, Some(&tx))
        .await
        .context("scan failed")?;
    drop(tx);
    let _ = printer.await;

    print_result(&result);
    Ok(())
}

async fn run_quick_scan(coordinator: &SyncCoordinator) -> anyhow::Result<()> {
    let result = coordinator.quick_scan(&cancel_on_ctrl_c()).await;
    print_result(&result);
    Ok(())
}

fn print_message(message: &InboundMessage) {
    match message {
        InboundMessage::Envelope(envelope) => match encode(envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{envelope:?}"),
        },
        InboundMessage::Undecoded { raw, .. } => println!("(undecoded) {raw}"),
    }
}

async fn run_connect(coordinator: &SyncCoordinator, host: Option<&str>) -> anyhow::Result<()> {
    let manager = coordinator.manager();
    let mut states = manager.subscribe_states();
    let mut messages = manager.subscribe_messages();
    let mut failures = manager.subscribe_failures();

    let endpoint = match host {
        Some(host) => coordinator
            .connect(host)
            .with_context(|| format!("invalid device address '{host}'"))?,
        None => match coordinator.auto_connect(&cancel_on_ctrl_c()).await {
            Some(endpoint) => endpoint,
            None => bail!("no device stored and none found by quick scan"),
        },
    };
    info!("holding link to {endpoint}; press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received Ctrl+C, disconnecting");
                break;
            }
            Some(change) = states.recv() => {
                eprintln!("[{}]", change.to);
                if change.to == ConnectionState::Failed {
                    coordinator.disconnect();
                    bail!("link to {endpoint} failed");
                }
            }
            Some(failure) = failures.recv() => eprintln!("! {failure}"),
            Some(message) = messages.recv() => print_message(&message),
        }
    }

    coordinator.disconnect();
    Ok(())
}

async fn run_send(
    coordinator: &SyncCoordinator,
    host: &str,
    envelope: &MessageEnvelope,
    wait: Duration,
) -> anyhow::Result<()> {
    let manager = coordinator.manager();
    let mut states = manager.subscribe_states();
    let mut messages = manager.subscribe_messages();

    let endpoint = coordinator
        .connect(host)
        .with_context(|| format!("invalid device address '{host}'"))?;

    let connected = tokio::time::timeout(wait, async {
        while let Some(change) = states.recv().await {
            match change.to {
                ConnectionState::Connected => return true,
                ConnectionState::Failed => return false,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !connected {
        coordinator.disconnect();
        bail!("could not connect to {endpoint}");
    }

    coordinator
        .send(envelope)
        .with_context(|| format!("failed to send '{}'", envelope.kind))?;

    let _ = tokio::time::timeout(wait, async {
        while let Some(message) = messages.recv().await {
            print_message(&message);
        }
    })
    .await;

    coordinator.disconnect();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_scan_defaults_to_common_prefix() {
        let cli = Cli::parse_from(["tank-link", "scan"]);

        assert!(matches!(cli.command, Command::Scan { ref prefix } if prefix == "192.168.1"));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        // Arrange / Act
        let cli = Cli::parse_from(["tank-link", "quick-scan", "--port", "8081", "--no-reconnect"]);

        // Assert
        assert_eq!(cli.port, Some(8081));
        assert!(cli.no_reconnect);
    }

    #[test]
    fn test_cli_send_parses_payload() {
        let cli = Cli::parse_from([
            "tank-link",
            "send",
            "192.168.1.100",
            "updateSettings",
            "--payload",
            r#"{"level":40}"#,
        ]);

        match cli.command {
            Command::Send {
                host,
                kind,
                payload,
                wait_ms,
            } => {
                assert_eq!(host, "192.168.1.100");
                assert_eq!(kind, "updateSettings");
                assert_eq!(payload.as_deref(), Some(r#"{"level":40}"#));
                assert_eq!(wait_ms, 3000);
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_connect_host_is_optional() {
        let cli = Cli::parse_from(["tank-link", "connect"]);

        assert!(matches!(cli.command, Command::Connect { host: None }));
    }

    #[test]
    fn test_apply_overrides_replaces_config_values() {
        // Arrange
        let cli = Cli::parse_from([
            "tank-link",
            "--port",
            "8081",
            "--no-reconnect",
            "--batch-size",
            "10",
            "--probe-timeout-ms",
            "750",
            "quick-scan",
        ]);
        let mut config = AppConfig::default();

        // Act
        cli.apply_overrides(&mut config).unwrap();

        // Assert
        assert_eq!(config.device.port, 8081);
        assert!(!config.device.reconnect);
        assert_eq!(config.scan.batch_size, 10);
        assert_eq!(config.scan.probe_timeout_ms, 750);
    }

    #[test]
    fn test_apply_overrides_without_flags_keeps_config() {
        let cli = Cli::parse_from(["tank-link", "quick-scan"]);
        let mut config = AppConfig::default();

        cli.apply_overrides(&mut config).unwrap();

        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_apply_overrides_rejects_zero_batch_size() {
        let cli = Cli::parse_from(["tank-link", "--batch-size", "0", "quick-scan"]);

        assert!(cli.apply_overrides(&mut AppConfig::default()).is_err());
    }

    #[test]
    fn test_write_config_round_trips_overrides_through_config_flag() {
        // Arrange
        let path = std::env::temp_dir()
            .join(format!("tanklink-cli-test-{}", std::process::id()))
            .join("config.toml");
        let path_arg = path.to_string_lossy().into_owned();
        let cli = Cli::parse_from([
            "tank-link",
            "--config",
            path_arg.as_str(),
            "--port",
            "8081",
            "write-config",
        ]);
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config).unwrap();

        // Act
        let written = cli.save_config(&config).unwrap();
        let reloaded = cli.load_config().unwrap();

        // Assert
        assert_eq!(written, path);
        assert_eq!(reloaded.device.port, 8081);
        assert_eq!(reloaded, config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_device_store_sits_next_to_config_flag() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("tanklink-cli-store-{}", std::process::id()));
        let config = dir.join("config.toml");
        let config_arg = config.to_string_lossy().into_owned();
        let cli = Cli::parse_from(["tank-link", "--config", config_arg.as_str(), "quick-scan"]);
        let endpoint = tank_core::DeviceEndpoint::new("192.168.1.100", 81);

        // Act
        cli.device_store().save(&endpoint).unwrap();

        // Assert
        let sibling = FileDeviceStore::new(dir.join("last_device.toml"));
        assert_eq!(sibling.load().unwrap(), Some(endpoint));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_parse_payload_accepts_object() {
        let payload = parse_payload(Some(r#"{"level":40,"auto":true}"#)).unwrap();

        assert_eq!(payload.get("level"), Some(&Value::from(40)));
        assert_eq!(payload.get("auto"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_parse_payload_rejects_non_object() {
        assert!(parse_payload(Some("[1,2]")).is_err());
        assert!(parse_payload(None).unwrap().is_empty());
    }
}
