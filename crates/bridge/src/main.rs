//! hw-bridge
//!
//! Serves JSON-line requests on stdin/stdout, connecting callers to hardware
//! wallets over USB HID and to device emulators over loopback UDP.

use anyhow::{Context, Result};
use bridge::config::BridgeConfig;
use bridge::storage::FileStateStore;
use bridge::transport::{HidTransport, TransportSet, UdpTransport};
use bridge::{Bridge, handle_line, service};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hw-bridge")]
#[command(author, version, about = "Hardware wallet bridge")]
#[command(long_about = "
Connects local applications to hardware wallets attached over USB, and to
device emulators listening on loopback UDP ports.

Requests are read from stdin and replies written to stdout, one JSON object
per line. Logs go to stderr.

EXAMPLES:
    # Serve requests with the default configuration
    hw-bridge

    # List attached devices and exit
    hw-bridge --list-devices

    # Talk to an emulator on port 21324
    echo '{\"type\": \"enumerate\"}' | hw-bridge --config bridge.toml

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hw-bridge/bridge.toml
    3. /etc/hw-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        eprintln!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let (config, load_error) = if let Some(ref path) = args.config {
        let config =
            BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?;
        (config, None)
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    if let Some(e) = load_error {
        warn!("Failed to load config: {:#}, using defaults", e);
    }

    info!("hw-bridge v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    let bridge = Arc::new(build_bridge(&config)?);

    let result = if args.list_devices {
        list_devices_mode(&bridge).await
    } else {
        run_service(bridge.clone()).await
    };

    info!("Shutting down connection worker...");
    bridge.shutdown().await;

    result
}

fn build_bridge(config: &BridgeConfig) -> Result<Bridge> {
    let mut transports = TransportSet::new();

    match HidTransport::new(config.device_filters()?) {
        Ok(hid) => transports.insert(Arc::new(hid)),
        Err(e) => warn!("USB unavailable, serving UDP devices only: {}", e),
    }
    if !config.udp.ports.is_empty() {
        info!("Emulator ports: {:?}", config.udp.ports);
        transports.insert(Arc::new(UdpTransport::new(config.udp.ports.clone())));
    }

    let keys = config.trusted_keys()?;
    let store = Arc::new(FileStateStore::new(config.state_path()));
    info!("State file: {}", store.path().display());

    Ok(Bridge::new(transports, keys, store, &config.listen))
}

async fn list_devices_mode(bridge: &Bridge) -> Result<()> {
    let devices = bridge
        .enumerate()
        .await
        .context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        let session = device
            .session
            .map(|session| session.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {:04x}:{:04x} session {}",
            device.path, device.vendor, device.product, session
        );
    }
    Ok(())
}

/// Serve stdin until EOF or Ctrl+C
///
/// Requests run concurrently so a pending `listen` or `call` never blocks the
/// next line; replies are written in completion order.
async fn run_service(bridge: Arc<Bridge>) -> Result<()> {
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rx.recv().await {
            stdout.write_all(reply.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status("Serving requests").context("Failed to send status to systemd")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut requests = JoinSet::new();
    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed");
                    break false;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let bridge = bridge.clone();
                let tx = tx.clone();
                requests.spawn(async move {
                    let reply = handle_line(&bridge, &line).await;
                    let _ = tx.send(reply);
                });
            }
            Some(finished) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = finished {
                    error!("Request handler failed: {}", e);
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break true;
            }
        }
    };

    service::notify_stopping().context("Failed to notify systemd stopping")?;

    if interrupted {
        requests.abort_all();
    }
    while let Some(finished) = requests.join_next().await {
        if let Err(e) = finished {
            if !e.is_cancelled() {
                error!("Request handler failed: {}", e);
            }
        }
    }

    drop(tx);
    writer
        .await
        .context("Reply writer panicked")?
        .context("Failed to write reply")?;

    info!("Bridge shutdown complete");
    Ok(())
}
