//! Conversion from the persisted [`Config`] into transport settings.

use std::time::Duration;

use gatelink_config::{Config, TransportConfig};
use gatelink_net::{ConnectionConfig, ServiceCategory, SocketConfig};

/// Errors in the `network` section that stop the client from starting.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettingsError {
    #[error("unknown service category {0:?}")]
    UnknownService(String),

    #[error("no service categories configured")]
    NoServices,
}

/// Build the transport configuration from `transport`.
pub fn connection_config(transport: &TransportConfig) -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
        stop_timeout: Duration::from_millis(transport.stop_timeout_ms),
        idle_backoff: Duration::from_millis(transport.idle_backoff_ms),
        recv_buffer_size: transport.recv_buffer_size,
        send_buffer_capacity: transport.send_buffer_capacity,
        socket: SocketConfig {
            tcp_nodelay: transport.tcp_nodelay,
            keepalive_enabled: transport.keepalive,
            keepalive_idle: Duration::from_secs(transport.keepalive_idle_secs),
            ..SocketConfig::default()
        },
    }
}

/// Fold the configured service names into one category mask.
pub fn service_categories(names: &[String]) -> Result<ServiceCategory, SettingsError> {
    let mut categories = ServiceCategory::NONE;
    for name in names {
        categories |= ServiceCategory::from_name(name)
            .ok_or_else(|| SettingsError::UnknownService(name.clone()))?;
    }
    if categories.is_empty() {
        return Err(SettingsError::NoServices);
    }
    Ok(categories)
}

/// Heartbeat period, or `None` when disabled.
pub fn heartbeat_interval(config: &Config) -> Option<Duration> {
    match config.network.heartbeat_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(u64::from(secs))),
    }
}
