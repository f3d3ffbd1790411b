//! Logging setup.
//!
//! `tracing` with an env-filter: verbosity picks the default level, the
//! `LOG` environment variable overrides per-target.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn is_test_env() -> bool {
    std::env::var_os("RUST_TEST_THREADS").is_some()
}

fn level_from_verbosity(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Initialise process-wide logging. Call once, before the loop thread
/// starts; later calls are ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
