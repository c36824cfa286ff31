//! gatelink: headless client for a gatelink backend.
//!
//! Loads `config.ron`, applies CLI overrides, connects with the configured
//! service categories, heartbeats, and reconnects with backoff until
//! interrupted.
//!
//! Run with: `cargo run -p gatelink-client -- --server 127.0.0.1 --port 7777`

mod handlers;
mod reconnect;
mod session;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gatelink_config::{CliArgs, Config};
use gatelink_net::GameClient;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::reconnect::ReconnectConfig;
use crate::session::{Exit, Runner, Shutdown, Target};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().or_else(Config::default_dir);
    let (mut config, load_error) = match config_dir.as_deref().map(Config::load_or_create) {
        Some(Ok(config)) => (config, None),
        Some(Err(err)) => (Config::default(), Some(err)),
        None => (Config::default(), None),
    };
    config.apply_cli_overrides(&args);

    gatelink_log::init_logging(None, cfg!(debug_assertions), Some(&config));

    info!("gatelink {}", env!("CARGO_PKG_VERSION"));
    if let Some(err) = load_error {
        warn!("Using default config: {err}");
    }

    let categories = match settings::service_categories(&config.network.services) {
        Ok(categories) => categories,
        Err(err) => {
            error!("Invalid network config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let registry = match handlers::build_registry(events_tx) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!("Handler registration failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let client = GameClient::new(registry, settings::connection_config(&config.transport));
    let runner = Runner {
        client: &client,
        target: Target {
            host: config.network.server_address.clone(),
            port: config.network.server_port,
            categories,
        },
        heartbeat: settings::heartbeat_interval(&config),
        reconnect: config
            .reconnect
            .enabled
            .then(|| ReconnectConfig::from(&config.reconnect)),
    };

    let (stop_tx, mut shutdown) = Shutdown::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = stop_tx.send(true);
            }
            Err(err) => warn!("Ctrl-C handler unavailable: {err}"),
        }
    });

    info!(
        "Connecting to {}:{} ({:?})",
        runner.target.host, runner.target.port, categories
    );
    let exit = runner.run(&mut shutdown, &mut events).await;
    client.shutdown().await;

    match exit {
        Exit::Shutdown => ExitCode::SUCCESS,
        Exit::Lost(disconnect) => {
            error!("Disconnected ({}): {}", disconnect.kind, disconnect.message);
            ExitCode::FAILURE
        }
        Exit::ConnectFailed(err) => {
            error!("Connection failed: {err}");
            ExitCode::FAILURE
        }
        Exit::GaveUp { attempts } => {
            error!("Giving up after {attempts} reconnection attempts");
            ExitCode::FAILURE
        }
    }
}
