//! Logging setup
//!
//! Installs a layered `tracing` subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, falling back to logging.level)
//!   └── Fmt Layer (text or json)
//! ```
//!
//! Hot log sites that could flood output go through a [`RateLimitedLogger`]
//! owned by the component that logs.
//!
//! # Example
//!
//! ```no_run
//! use kura::config::LoggingConfig;
//! use kura::logging::init_subscriber;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_subscriber(&LoggingConfig::default())?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

mod rate_limited;

pub use rate_limited::RateLimitedLogger;

/// Errors that can occur during logging initialization
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Install the global subscriber.
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::InvalidFilter(config.level.clone(), e.to_string()))?,
    };

    let result = if config.format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer),
        )
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer),
        )
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
