//! Logging initialization and configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "coordkit=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the logging system.
///
/// Uses the `RUST_LOG` environment variable for filtering. If not set,
/// defaults to `coordkit=info`.
///
/// # Panics
///
/// Panics if called more than once, or if another tracing subscriber
/// has already been set.
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Try to initialize the logging system.
///
/// Returns `Ok(())` if successful, or `Err` if logging has already been
/// initialized.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

/// Initialize logging with an explicit filter, e.g. from the config file.
///
/// A bare level such as `debug` applies to this crate only; anything else is
/// taken as a full `EnvFilter` directive.
pub fn init_with_level(level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let directive = filter_directive(level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

fn filter_directive(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        lvl @ ("error" | "warn" | "info" | "debug" | "trace" | "off") => {
            format!("coordkit={}", lvl)
        }
        _ => level.to_string(),
    }
}
