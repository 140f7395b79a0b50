//! Session-scoped wiring of server, clone pool and backend injector.

use std::path::Path;

use tracing::info_span;

use crate::backend::BackendInjector;
use crate::clone::{CleanupReport, CloneLease, ClonePool, DatabaseName};
use crate::error::{CloneResult, Result};
use crate::observability::LOG_TARGET;
use crate::server::{ConnectionSettings, EphemeralServer};
use crate::settings::SessionSettings;

/// A running server plus the pool and injector that hand out its clones.
///
/// Dropping the session stops the server and removes its directory.
///
/// # Examples
/// ```no_run
/// use pg_ephemeral_clones::{SessionSettings, TestSession};
///
/// # fn main() -> pg_ephemeral_clones::Result<()> {
/// let session = TestSession::start(SessionSettings::default())?;
/// let database = session.database_for("tests::orders::totals")?;
/// let url = database.url();
/// # let _ = url;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TestSession {
    server: EphemeralServer,
    pool: ClonePool,
    injector: BackendInjector,
}

impl TestSession {
    /// Starts the server and builds the pool and injector on top of it.
    ///
    /// # Errors
    /// Returns any error from [`EphemeralServer::start`].
    pub fn start(settings: SessionSettings) -> Result<Self> {
        let _span = info_span!(target: LOG_TARGET, "test_session").entered();
        let server = EphemeralServer::start(settings.server)?;
        let pool = ClonePool::new(
            server.admin(),
            server.template(),
            &settings.pool,
            Some(server.locks_dir().to_owned()),
        );
        let injector = BackendInjector::new(pool.clone(), server.connection().clone());
        Ok(Self {
            server,
            pool,
            injector,
        })
    }

    /// Starts a session configured from `PG_EPHEMERAL_*` environment
    /// variables.
    ///
    /// # Errors
    /// Returns a [`ConfigError`](crate::ConfigError) for invalid
    /// configuration, otherwise any error from [`start`](Self::start).
    pub fn from_env() -> Result<Self> {
        let settings = crate::PgEphemeralCfg::load()?.to_settings()?;
        Self::start(settings)
    }

    /// Returns the connection settings of the running server.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionSettings {
        self.server.connection()
    }

    /// Returns the underlying server.
    #[must_use]
    pub const fn server(&self) -> &EphemeralServer {
        &self.server
    }

    /// Returns the clone pool.
    #[must_use]
    pub const fn pool(&self) -> &ClonePool {
        &self.pool
    }

    /// Returns the backend injector.
    #[must_use]
    pub const fn injector(&self) -> &BackendInjector {
        &self.injector
    }

    /// Resolves and leases the clone for `identity` and returns a guard that
    /// releases it and runs the cleanup policy when the test finishes.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) when the clone cannot be
    /// resolved.
    pub fn database_for(&self, identity: impl AsRef<[u8]>) -> CloneResult<TestDatabase> {
        let lease = self.pool.lease(identity)?;
        Ok(TestDatabase::new(
            lease,
            self.server.connection().clone(),
            self.test_boundary(),
        ))
    }

    /// Path-identity variant of [`database_for`](Self::database_for).
    ///
    /// # Errors
    /// See [`database_for`](Self::database_for).
    pub fn database_for_path(&self, path: &Path) -> CloneResult<TestDatabase> {
        let lease = self.pool.lease_path(path)?;
        Ok(TestDatabase::new(
            lease,
            self.server.connection().clone(),
            self.test_boundary(),
        ))
    }

    /// Returns a guard marking the end of a test that reaches its clone
    /// through the [`injector`](Self::injector) rather than
    /// [`database_for`](Self::database_for).
    ///
    /// Bind the guard before opening storage so it drops last: storage
    /// still alive at the boundary keeps its clone leased.
    ///
    /// # Examples
    /// ```no_run
    /// use std::path::Path;
    ///
    /// use pg_ephemeral_clones::{SessionSettings, StorageBackend, TestSession};
    ///
    /// # fn main() -> pg_ephemeral_clones::Result<()> {
    /// let session = TestSession::start(SessionSettings::default())?;
    /// let _boundary = session.test_boundary();
    /// let storage = session.injector().open(Path::new("/tmp/test-a"));
    /// let database = storage.database()?;
    /// # let _ = database;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use = "the boundary runs when the guard drops"]
    pub fn test_boundary(&self) -> TestBoundary {
        TestBoundary::new(self.pool.clone())
    }

    /// Stops the server. Idempotent.
    pub fn stop(&mut self) {
        self.server.stop();
    }
}

/// Runs `f` against a freshly started session and stops the server
/// afterwards, whether `f` returns or unwinds.
///
/// # Errors
/// Returns any error from [`TestSession::start`]; the value produced by `f`
/// is passed through untouched.
pub fn with_session<T>(settings: SessionSettings, f: impl FnOnce(&TestSession) -> T) -> Result<T> {
    let mut session = TestSession::start(settings)?;
    let value = f(&session);
    session.stop();
    Ok(value)
}

/// End of one test. Dropping the guard runs the pool's cleanup policy
/// exactly once, also when the test panics.
#[derive(Debug)]
pub struct TestBoundary {
    pool: Option<ClonePool>,
}

impl TestBoundary {
    /// Creates a boundary guard for `pool`.
    #[must_use]
    pub const fn new(pool: ClonePool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Ends the test now and returns what the cleanup pass did.
    #[must_use = "the report lists clones that could not be dropped"]
    pub fn finish(mut self) -> CleanupReport {
        self.run()
    }

    fn run(&mut self) -> CleanupReport {
        self.pool
            .take()
            .map(|pool| pool.on_test_boundary())
            .unwrap_or_default()
    }
}

impl Drop for TestBoundary {
    fn drop(&mut self) {
        self.run();
    }
}

/// A test's leased clone. Dropping it releases the lease and then marks the
/// test boundary, also when the test panics.
#[derive(Debug)]
pub struct TestDatabase {
    // Field order matters: the lease is released before the boundary runs.
    lease: CloneLease,
    connection: ConnectionSettings,
    boundary: TestBoundary,
}

impl TestDatabase {
    pub(crate) const fn new(
        lease: CloneLease,
        connection: ConnectionSettings,
        boundary: TestBoundary,
    ) -> Self {
        Self {
            lease,
            connection,
            boundary,
        }
    }

    /// Returns the clone's database name.
    #[must_use]
    pub const fn name(&self) -> &DatabaseName {
        self.lease.database_name()
    }

    /// Returns the server connection settings.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionSettings {
        &self.connection
    }

    /// Returns a connection URL for the clone.
    #[must_use]
    pub fn url(&self) -> String {
        self.connection.database_url(self.name().as_str())
    }

    /// Releases the clone, ends the test now and returns what the cleanup
    /// pass did.
    #[must_use = "the report lists clones that could not be dropped"]
    pub fn finish(self) -> CleanupReport {
        let Self { lease, boundary, .. } = self;
        drop(lease);
        boundary.finish()
    }
}
