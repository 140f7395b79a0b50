//! rstest fixtures over the shared session.

use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(doc))]
use rstest::fixture;

use super::shared::shared_session;
use super::skip::format_skip_reason;
use crate::session::{TestBoundary, TestDatabase, TestSession};

static ANONYMOUS_TESTS: AtomicUsize = AtomicUsize::new(0);

/// rstest fixture returning the shared session.
///
/// Panics with a `SKIP-TEST-CLUSTER` message when the session cannot be
/// started.
///
/// # Panics
/// When the shared session fails to start.
#[must_use]
#[cfg_attr(not(doc), fixture)]
pub fn shared_session_fixture() -> &'static TestSession {
    match shared_session() {
        Ok(session) => session,
        Err(err) => panic!(
            "{}",
            format_skip_reason(format!("shared session failed to start PostgreSQL: {err:?}"))
        ),
    }
}

/// rstest fixture resolving a clone for the current test.
///
/// The identity is the test thread's name, which the standard harness sets
/// to the test path. The returned guard runs the cleanup policy on drop.
///
/// # Panics
/// When the session cannot be started or the clone cannot be resolved.
///
/// # Examples
/// ```ignore
/// use rstest::rstest;
/// use pg_ephemeral_clones::TestDatabase;
/// use pg_ephemeral_clones::test_support::test_database;
///
/// #[rstest]
/// fn inserts_rows(test_database: TestDatabase) {
///     let url = test_database.url();
///     // ...
/// }
/// ```
#[must_use]
#[cfg_attr(not(doc), fixture)]
pub fn test_database() -> TestDatabase {
    let session = shared_session_fixture();
    let identity = test_identity();
    match session.database_for(&identity) {
        Ok(database) => database,
        Err(err) => panic!("failed to resolve a clone for '{identity}': {err:?}"),
    }
}

/// rstest fixture marking the end of a test that uses the shared session's
/// backend injector instead of [`test_database`].
///
/// Arguments drop after the test body's locals, so storage opened in the
/// body is released before the boundary runs.
///
/// # Panics
/// When the shared session cannot be started.
///
/// # Examples
/// ```ignore
/// use std::path::Path;
/// use rstest::rstest;
/// use pg_ephemeral_clones::TestBoundary;
/// use pg_ephemeral_clones::test_support::{shared_session, test_boundary};
///
/// #[rstest]
/// fn stores_uploads(test_boundary: TestBoundary) {
///     let injector = shared_session().expect("session").injector();
///     let storage = injector.open(Path::new("/tmp/uploads"));
///     // ...
/// }
/// ```
#[must_use]
#[cfg_attr(not(doc), fixture)]
pub fn test_boundary() -> TestBoundary {
    shared_session_fixture().test_boundary()
}

fn test_identity() -> String {
    std::thread::current().name().map_or_else(
        || {
            let index = ANONYMOUS_TESTS.fetch_add(1, Ordering::Relaxed);
            format!("anonymous-test-{}-{index}", std::process::id())
        },
        str::to_owned,
    )
}
