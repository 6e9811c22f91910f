//! Logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVES: &str = "info,commhub_core=info";

/// Initialize the global tracing subscriber.
///
/// Installs a compact `fmt` layer filtered by `RUST_LOG`, falling back to
/// `default_directives` (or [`DEFAULT_DIRECTIVES`]) when the variable is unset
/// or invalid.
///
/// Returns an error if a global subscriber is already installed.
///
/// # Example
///
/// ```no_run
/// use commhub_core::telemetry::init_tracing;
///
/// init_tracing(Some("debug,commhub_core=trace")).expect("tracing already initialized");
/// ```
pub fn init_tracing(
    default_directives: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives.unwrap_or(DEFAULT_DIRECTIVES)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(true))
        .try_init()?;

    tracing::info!(target: "telemetry", "Tracing initialized");
    Ok(())
}

/// Tracing for tests: debug level, captured by the test harness, safe to
/// call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
