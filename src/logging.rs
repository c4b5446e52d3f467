//! Tracing subscriber initialization helpers.

use tracing_subscriber::{EnvFilter, fmt};

/// Install a global subscriber filtered by `filter`, else `RUST_LOG`, else `info`.
///
/// Safe to call more than once; later calls no-op.
pub fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None if std::env::var("RUST_LOG").is_ok() => EnvFilter::from_default_env(),
        None => EnvFilter::new("info"),
    };

    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
