//! Logging setup and small formatting helpers

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tessera_types::{LoggingConfig, Result, TesseraError};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` directives take precedence over the configured level. Fails
/// if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    config.validate()?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    installed.map_err(|e| TesseraError::config(format!("Failed to initialize logging: {}", e)))?;

    info!(
        "Logging initialized with level: {} and format: {}",
        config.level, config.format
    );
    Ok(())
}

/// Format a byte count in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
