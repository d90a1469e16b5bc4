//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    tracing_subscriber::registry()
        .with(filter(default_level)?)
        .with(fmt::layer().with_thread_names(true))
        .init();

    Ok(())
}

/// Like [`setup_logging`] but tolerates an already installed subscriber
///
/// Returns `false` when a global subscriber was already set. Output goes
/// through the test writer so it is captured by the harness.
pub fn try_setup_logging(default_level: &str) -> crate::Result<bool> {
    Ok(tracing_subscriber::registry()
        .with(filter(default_level)?)
        .with(fmt::layer().with_test_writer())
        .try_init()
        .is_ok())
}
