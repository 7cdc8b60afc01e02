//! Process-wide tracing subscriber.

use std::io::IsTerminal;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, ServerError};

/// Filter applied when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "tserver=info";

/// Installs a stderr subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| ServerError::InvalidArgument(format!("invalid log filter: {e}")))?,
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|_| ServerError::InvalidArgument("logging already initialized".into()))
}
