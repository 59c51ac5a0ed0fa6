use tracing_subscriber::EnvFilter;

/// Initializes a minimal stderr `tracing` subscriber honoring `RUST_LOG`.
///
/// Called once, before any GPIO/SPI/socket setup, so setup failures are logged
/// through the same path as steady-state ones.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
