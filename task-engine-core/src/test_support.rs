use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a env-filtered tracing subscriber once per test binary, mirroring
/// how the embedding application would wire up logging at startup. Safe to
/// call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_test_writer()
            .try_init();
    });
}
