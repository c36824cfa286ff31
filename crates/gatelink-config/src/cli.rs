//! Command-line argument parsing for the gatelink client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// gatelink command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "gatelink", about = "Headless gatelink transport client")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Comma-separated service categories (common, login, game, cheat).
    #[arg(long, value_delimiter = ',')]
    pub services: Option<Vec<String>>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Disable automatic reconnection.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(ref services) = args.services {
            self.network.services = services.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.no_reconnect {
            self.reconnect.enabled = false;
        }
    }
}
