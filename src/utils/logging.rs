//! Tracing subscriber setup for applications embedding the engine.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the `EnvFilter` directives.
pub const LOG_ENV: &str = "STREAMTURN_LOG";

/// Installs a formatting subscriber filtered by `STREAMTURN_LOG` (default
/// `info`). Returns false when a global subscriber was already set, which
/// makes repeated calls harmless.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_target(true)
        .try_init()
        .is_ok()
}

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
