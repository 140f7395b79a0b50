//! Helpers for test suites built on the harness.
//!
//! The shared session starts one server per test binary and stops it from an
//! `atexit` hook; fixtures wrap it for rstest; the skip helpers let suites
//! degrade gracefully on hosts without `PostgreSQL` binaries.

mod fixtures;
#[cfg(any(test, feature = "test-logging"))]
mod logging;
mod shared;
mod skip;

pub use fixtures::{shared_session_fixture, test_boundary, test_database};
#[cfg(any(test, feature = "test-logging"))]
pub use logging::capture_warn_logs;
pub use shared::shared_session;
pub use skip::{
    SKIP_TEST_CLUSTER_PREFIX, format_skip_reason, postgres_binaries_available,
    postgres_unavailable_reason,
};
