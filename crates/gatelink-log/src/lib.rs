//! Structured logging for the gatelink client.
//!
//! Console output with uptime timestamps and module paths, plus JSON file
//! logging in debug builds. The filter comes from `RUST_LOG` when set,
//! otherwise from the config's `debug.log_level`.

use std::fs::File;
use std::path::Path;

use gatelink_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// File name of the JSON log written in debug builds.
pub const LOG_FILE: &str = "gatelink.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file; falls back to
///   `config.debug.log_dir` when `None`
/// * `debug_build` - enables the file layer
/// * `config` - source of the log level override
///
/// ```no_run
/// use gatelink_config::Config;
/// use gatelink_log::init_logging;
///
/// let config = Config::default();
/// init_logging(None, cfg!(debug_assertions), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let log_dir = log_dir.or_else(|| config.and_then(|c| c.debug.log_dir.as_deref()));
    if debug_build
        && let Some(log_dir) = log_dir
        && let Some(log_file) = open_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Filter directive taken from `config`, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

fn open_log_file(log_dir: &Path) -> Option<File> {
    std::fs::create_dir_all(log_dir).ok()?;
    File::create(log_dir.join(LOG_FILE)).ok()
}
