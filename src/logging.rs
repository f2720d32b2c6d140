//! Tracing subscriber setup
//!
//! Console output always; a daily-rolling file when a log directory is
//! configured. `RUST_LOG` overrides the configured filter.

use crate::config::LoggingConfig;
use crate::error::{FleetError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` when set, the configured directives otherwise
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the whole run. Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| FleetError::Config(format!("Failed to create log directory {:?}: {}", dir, e)))?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| FleetError::Config(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}
