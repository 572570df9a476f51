//! Small shared helpers

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global fmt subscriber honoring `RUST_LOG`, defaulting to
/// `info`.
///
/// Intended for binaries and integration tests; safe to call more
/// than once (later calls are no-ops).
pub fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
