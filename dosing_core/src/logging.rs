//! Logging setup shared by the library's consumers.
//!
//! The library itself only emits `tracing` events; binaries choose where they
//! go. Writes report merge and prune counts at `debug`, degraded reads at
//! `warn`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging at `warn` so command output stays clean.
///
/// RUST_LOG overrides the default, e.g. `RUST_LOG=dosing_core=debug`.
pub fn init() {
    init_with_level("warn")
}

/// Initialize logging with a specific default level
///
/// # Arguments
/// * `default_level` - Default filter directive (e.g. `info`, `dosing_core=debug`)
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("dosing_core=debug"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test();
        init_with_level("debug");
        tracing::debug!("logging initialized twice without panicking");
    }
}
