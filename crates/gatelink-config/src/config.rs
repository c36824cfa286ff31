//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend endpoint and service selection.
    pub network: NetworkConfig,
    /// Transport tunables.
    pub transport: TransportConfig,
    /// Client-side reconnection policy.
    pub reconnect: ReconnectSettings,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Backend endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Backend host name or address.
    pub server_address: String,
    /// Backend port.
    pub server_port: u16,
    /// Service categories this connection carries (`common`, `login`,
    /// `game`, `cheat`).
    pub services: Vec<String>,
    /// Seconds between keepalive messages (0 = disabled).
    pub heartbeat_interval_secs: u32,
}

/// Transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Upper bound on loop teardown in milliseconds.
    pub stop_timeout_ms: u64,
    /// Longest idle sleep of the send loop in milliseconds.
    pub idle_backoff_ms: u64,
    /// Receive buffer size in bytes.
    pub recv_buffer_size: usize,
    /// Initial outbound buffer capacity in bytes.
    pub send_buffer_capacity: usize,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive probes.
    pub keepalive: bool,
    /// Idle seconds before the first keepalive probe.
    pub keepalive_idle_secs: u64,
}

/// Reconnection policy applied by the client binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Reconnect after an unexpected disconnect.
    pub enabled: bool,
    /// Delay before the first attempt in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the delay between attempts in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "gatelink_net=trace").
    pub log_level: String,
    /// Directory for JSON log files in debug builds.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            services: vec!["common".to_string(), "game".to_string()],
            heartbeat_interval_secs: 5,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            stop_timeout_ms: 2_000,
            idle_backoff_ms: 10,
            recv_buffer_size: 64 * 1024,
            send_buffer_capacity: 8 * 1024,
            tcp_nodelay: true,
            keepalive: true,
            keepalive_idle_secs: 60,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the client (`<config_dir>/gatelink`).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gatelink"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
