use std::sync::Once;

static INIT: Once = Once::new();

/// Installs an `EnvFilter`-based fmt subscriber once per test binary.
///
/// Guarded so re-running it from multiple test functions in the same
/// binary never panics on a second global-subscriber install.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
