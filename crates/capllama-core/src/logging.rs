//! tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::errors::{PluginError, Result};

/// Target used for lines forwarded from the native delegate.
pub const NATIVE_TARGET: &str = "capllama::native";

/// Installs the global subscriber. `RUST_LOG` takes precedence over `config.level`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| {
            // no subscriber yet, so no tracing::warn!
            eprintln!("Warning: invalid log level '{}', using 'info'", config.level);
            EnvFilter::new("info")
        })
    });

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| PluginError::failed(format!("logging already initialized: {e}")))
}

/// Routes a native `(level, text)` pair to the matching tracing level.
pub fn forward_native(level: &str, text: &str) {
    let text = text.trim_end();
    match level {
        "error" => tracing::error!(target: NATIVE_TARGET, "{text}"),
        "warn" => tracing::warn!(target: NATIVE_TARGET, "{text}"),
        "debug" => tracing::debug!(target: NATIVE_TARGET, "{text}"),
        "trace" => tracing::trace!(target: NATIVE_TARGET, "{text}"),
        _ => tracing::info!(target: NATIVE_TARGET, "{text}"),
    }
}
