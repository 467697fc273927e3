//! Test utilities and helpers
//!
//! Tests share one quiet tracing subscriber; installing it twice would fail.

use once_cell::sync::Lazy;

static TEST_LOGGING: Lazy<()> = Lazy::new(|| {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "error".to_string());
    // Another harness may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

/// Initialize test environment once for all tests
pub fn init_test_env() {
    Lazy::force(&TEST_LOGGING);
}
