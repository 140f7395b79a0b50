//! Process-wide shared session.
//!
//! The session is started lazily on first access and leaked so it lives for
//! the whole test binary. Because `Drop` never runs for a leaked value, an
//! `atexit` hook stops the postmaster and removes the temporary directory.

use std::sync::{Mutex, OnceLock, PoisonError};

use color_eyre::eyre::eyre;

use crate::error::{ProvisionError, ProvisionStep, Result};
use crate::server::exit_hook::register_exit_hook;
use crate::session::TestSession;

/// Uses `OnceLock<Mutex<...>>` so initialisation can fail while later callers
/// still see a consistent state.
static SHARED_SESSION: OnceLock<Mutex<SharedState>> = OnceLock::new();

enum SharedState {
    Uninitialised,
    Initialised(&'static TestSession),
    /// Rendered message of the first failure, replayed to later callers.
    Failed(String),
}

/// Returns the shared session, starting it from `PG_EPHEMERAL_*` settings on
/// the first call.
///
/// # Errors
/// Returns the start error on the first call. Once a start has failed, every
/// later call fails with a provisioning error quoting the original failure
/// instead of retrying.
///
/// # Examples
/// ```no_run
/// use pg_ephemeral_clones::test_support::shared_session;
///
/// # fn main() -> pg_ephemeral_clones::Result<()> {
/// let session = shared_session()?;
/// assert!(std::ptr::eq(session, shared_session()?));
/// # Ok(())
/// # }
/// ```
pub fn shared_session() -> Result<&'static TestSession> {
    let mutex = SHARED_SESSION.get_or_init(|| Mutex::new(SharedState::Uninitialised));
    let mut guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);

    match &*guard {
        SharedState::Initialised(session) => Ok(*session),
        SharedState::Failed(message) => Err(ProvisionError::new(
            ProvisionStep::Start,
            eyre!("shared session initialisation previously failed: {message}"),
        )
        .into()),
        SharedState::Uninitialised => match TestSession::from_env() {
            Ok(session) => {
                let leaked: &'static TestSession = Box::leak(Box::new(session));
                register_best_effort(leaked);
                *guard = SharedState::Initialised(leaked);
                Ok(leaked)
            }
            Err(err) => {
                *guard = SharedState::Failed(err.to_string());
                Err(err)
            }
        },
    }
}

/// Failure leaves the session usable; the postmaster may then outlive the
/// test binary.
fn register_best_effort(session: &TestSession) {
    let server = session.server();
    let Some(handle) = server.handle() else {
        return;
    };
    if let Err(err) = register_exit_hook(
        handle.pid(),
        server.root_dir().as_std_path().to_path_buf(),
        server.settings().shutdown_timeout,
    ) {
        tracing::debug!(
            target: crate::observability::LOG_TARGET,
            error = %err,
            "exit hook registration failed; postmaster may be orphaned on exit"
        );
    }
}
