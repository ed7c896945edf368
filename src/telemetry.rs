use tracing_subscriber::{fmt, EnvFilter};

/// key: billing-telemetry -> JSON structured logs filtered by `RUST_LOG`
///
/// Falls back to `info` when no filter is configured. Safe to call more than once; only
/// the first subscriber is installed.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).json().try_init();
}
