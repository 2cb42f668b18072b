//! Test doubles for the external collaborator traits, plus small option
//! builders shared across scenario tests.

mod doubles;
mod mocks;

pub use doubles::{NoopQuiescer, NoopShifter, NoopTable, NoopTrace, RecordingLinker, hooks};
pub use mocks::MockTestLinker;

use fcache::CacheOptions;

/// A private, unbounded cache configuration with working-set growth
/// disabled, the baseline most scenario tests start from and override.
#[must_use]
pub fn unbounded_options() -> CacheOptions {
    CacheOptions::unbounded()
}

/// Initializes a `RUST_LOG`-gated `tracing` subscriber for test output,
/// ignoring the "already set" error from a second call in the same process.
/// Call this once at the top of any test that wants to inspect placement/
/// flush/eviction logging.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
