/// Tracing subscriber setup
use crate::config::{LogFormat, LoggingConfig};
use crate::errors::{DaemonError, DaemonResult};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` directives plus the configured level.
pub fn env_filter(level: &str) -> DaemonResult<EnvFilter> {
    let directive: Directive = level
        .parse()
        .map_err(|e| DaemonError::Config(format!("Invalid log level '{}': {}", level, e)))?;
    Ok(EnvFilter::from_default_env().add_directive(directive))
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> DaemonResult<()> {
    let filter = env_filter(&config.level)?;
    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
    result.map_err(|e| DaemonError::Config(format!("Failed to install logger: {}", e)))
}
