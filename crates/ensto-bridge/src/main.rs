//! # ensto-bridge
//!
//! Polls Ensto BLE thermostats and publishes their readings to MQTT with
//! Home Assistant discovery.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package ensto-bridge -- --config ./config.toml
//!
//! # Production (systemd)
//! ./ensto-bridge --production
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ensto_bridge::{logging, MqttPublisher};
use ensto_core::{BleTransport, Bridge, BridgeConfig, BridgeError, SecretStore, SessionState};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Ensto BLE thermostat to MQTT bridge.
#[derive(Debug, Parser)]
#[command(name = "ensto-bridge", version, about)]
struct Args {
    /// Configuration file.
    #[arg(short, long, env = "ENSTO_CONFIG")]
    config: Option<PathBuf>,

    /// JSON logs to a rolling file plus compact stdout.
    #[arg(long, env = "ENSTO_PRODUCTION")]
    production: bool,

    /// Log filter, e.g. `debug` or `ensto_core=debug,rumqttc=warn`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.production, args.log_level.as_deref())?;

    let config_path = args.config.unwrap_or_else(BridgeConfig::default_path);
    info!(config = %config_path.display(), "Starting ensto-bridge");

    let config = startup(
        BridgeConfig::load(&config_path),
        &format!("loading {}", config_path.display()),
    )?;
    let store = startup(
        SecretStore::open_file(&config.storage_path),
        "opening the secret store",
    )?;

    let transport = transport(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (publisher, mqtt_task) = MqttPublisher::start(&config.mqtt, shutdown_rx.clone());
    if !publisher.wait_connected(Duration::from_secs(10)).await {
        warn!("MQTT broker not reachable yet; readings are dropped until it is");
    }

    let bridge = Bridge::new(&config, transport, Arc::new(store), Arc::new(publisher));
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        let _ = signal_tx.send(true);
    });

    let statuses = bridge.run(shutdown_rx).await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = mqtt_task.await {
        warn!(error = %err, "MQTT task ended abnormally");
    }

    let unpollable: Vec<&str> = statuses
        .iter()
        .filter(|s| s.state == SessionState::Fatal)
        .map(|s| s.identifier.as_str())
        .collect();
    if !unpollable.is_empty() && unpollable.len() == statuses.len() {
        let codes: Vec<&str> = statuses.iter().filter_map(|s| s.last_error.as_deref()).collect();
        error!(devices = ?unpollable, codes = ?codes, "No device could be polled");
        anyhow::bail!("all devices are unpollable: {}", unpollable.join(", "));
    }

    info!("ensto-bridge stopped");
    Ok(())
}

/// Log a startup failure with its error code and turn it into the exit error.
fn startup<T, E: Into<BridgeError>>(result: Result<T, E>, what: &str) -> anyhow::Result<T> {
    result.map_err(|err| {
        let err: BridgeError = err.into();
        error!(code = err.error_code(), fatal = err.is_fatal(), error = %err, "Startup failed while {what}");
        anyhow::Error::new(err).context(what.to_string())
    })
}

#[cfg(feature = "bluetooth")]
async fn transport(config: &BridgeConfig) -> anyhow::Result<Arc<dyn BleTransport>> {
    let scan_timeout = Duration::from_secs(config.session.scan_timeout_secs);
    let transport = startup(
        ensto_core::BluerTransport::new(scan_timeout).await,
        "initializing Bluetooth",
    )?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn transport(_config: &BridgeConfig) -> anyhow::Result<Arc<dyn BleTransport>> {
    anyhow::bail!("ensto-bridge was built without the `bluetooth` feature")
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
