//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; binaries call
//! [`init_tracing`] once to install a subscriber.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format of the console subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install a global subscriber filtered by `RUST_LOG` (falling back to
/// `default_level`). Safe to call more than once; an already installed
/// global subscriber is left alone.
pub fn init_tracing(format: LogFormat, default_level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr);

        let installed = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };

        if installed.is_err() {
            tracing::debug!("global tracing subscriber already initialized - keeping it");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing(LogFormat::Text, "warn");
        init_tracing(LogFormat::Json, "debug");
        tracing::info!("still logging");
    }
}
