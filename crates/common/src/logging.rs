//! Logging setup and configuration

use std::io;
use tracing::Level;
use tracing_subscriber::{filter, fmt, prelude::*, EnvFilter};

/// Setup tracing subscribers for the application.
///
/// Normal event traces go to standard output; warnings and errors go to
/// standard error, where a supervisor log collector expects diagnostics.
/// `RUST_LOG` overrides the default level filter.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("invalid log filter: {}", e)))?;

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter::filter_fn(|meta| *meta.level() <= Level::WARN));
    let stdout_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(filter::filter_fn(|meta| *meta.level() > Level::WARN));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(stdout_layer)
        .init();

    Ok(())
}
