//! Logging initialization.
//!
//! The engine logs through `tracing`; nothing is printed until a subscriber is
//! installed. Call one of these once, before binding the server.
//!
//! `RUST_LOG` takes precedence over the level passed in:
//!
//! ```bash
//! RUST_LOG=webserv_core=debug webserv --config config/default.toml
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Human-readable logs on stdout.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// One JSON object per line, for log shippers.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
