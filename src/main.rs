#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # velo
//!
//! Live fleet position feed. Connects to an IoT message broker over a
//! SigV4-presigned WebSocket, subscribes to every vehicle's position topic and
//! keeps the latest fix per vehicle.
//!
//! ## Subcommands
//!
//! - `velo watch` (default) — connect and log vehicle updates until Ctrl-C
//! - `velo sign` — print one presigned connection URL and exit
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, tracing setup, shutdown
//! config.rs        — TOML + env-var configuration
//! sigv4.rs         — presigned URL construction (canonical request + HMAC chain)
//! store/
//!   mod.rs         — VehicleStore: connection state machine, observers
//!   table.rs       — VehiclePosition, topic/payload parsing
//! transport/
//!   mod.rs         — Transport / Connection traits
//!   mqtt.rs        — rumqttc over wss://
//!   demo.rs        — simulated fleet
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use velo::transport::demo::DemoTransport;
use velo::transport::mqtt::MqttTransport;
use velo::transport::Transport;
use velo::{Config, ConnectionState, StoreEvent, VehicleStore};

/// Live fleet position feed client.
#[derive(Parser)]
#[command(name = "velo", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log vehicle positions (default when no subcommand given).
    Watch {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print a presigned connection URL.
    Sign {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Sign { config }) => sign(config.as_deref()),
        Some(Commands::Watch { config }) => watch(config.as_deref()).await,
        None => watch(None).await,
    };

    if let Err(e) = result {
        eprintln!("velo: {e}");
        std::process::exit(1);
    }
}

fn sign(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let url = config.signer()?.sign();
    println!("{url}");
    Ok(())
}

async fn watch(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("velo v{} starting", env!("CARGO_PKG_VERSION"));

    let transport: Arc<dyn Transport> = if config.demo.enabled {
        info!("Demo mode: simulated fleet every {}ms", config.demo.interval_ms);
        Arc::new(DemoTransport::new(Duration::from_millis(
            config.demo.interval_ms,
        )))
    } else {
        info!(
            "Broker: {} ({}), topic {}",
            config.broker.host, config.broker.region, config.broker.topic
        );
        Arc::new(MqttTransport::new(Duration::from_secs(
            config.broker.keep_alive_secs,
        )))
    };

    // Demo mode needs no broker; sign against a placeholder when none is set.
    let signer = if config.demo.enabled && config.broker.host.is_empty() {
        velo::Signer::new(
            "demo.invalid",
            config.broker.region.clone(),
            velo::Credential::new("demo", "demo"),
        )?
    } else {
        config.signer()?
    };

    let store = VehicleStore::new(signer, transport, config.store_settings());
    let mut events = store.events();
    store.connect();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StoreEvent::VehicleUpdated(pos)) => {
                    let speed = pos
                        .speed
                        .map_or_else(|| "-".to_string(), |s| format!("{s:.0} km/h"));
                    info!(
                        "{}: {:.5}, {:.5} speed={speed} at {}",
                        pos.id, pos.latitude, pos.longitude, pos.timestamp
                    );
                }
                Ok(StoreEvent::StateChanged(ConnectionState::Errored(reason))) => {
                    warn!("Connection error: {reason}");
                }
                Ok(StoreEvent::StateChanged(state)) => {
                    info!("Connection state: {state:?}");
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {n} store events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    store.disconnect().await;
    let snapshot = store.snapshot();
    info!("Tracked {} vehicles", snapshot.vehicles.len());
    Ok(())
}
