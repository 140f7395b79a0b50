//! Per-test template clones and their bounded lifetime.
//!
//! A [`ClonePool`] is the session-scoped service that owns the
//! [`CloneRegistry`], resolves identities through a [`DatabaseCloner`] and
//! trims the registry with a [`CleanupPolicy`].

mod cleanup;
mod cloner;
mod fingerprint;
mod lease;
mod lock;
mod registry;

pub use self::cleanup::{CleanupPolicy, CleanupReport};
pub use self::cloner::DatabaseCloner;
pub use self::fingerprint::{DatabaseName, Fingerprint};
pub use self::lease::CloneLease;
pub use self::registry::{CloneOrigin, CloneRecord, CloneRegistry};

use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::admin::DatabaseAdmin;
use crate::error::CloneResult;
use crate::settings::PoolSettings;

/// Registry, cloner and cleanup policy sharing one lifetime.
///
/// # Examples
/// ```no_run
/// use pg_ephemeral_clones::{ClonePool, EphemeralServer, PoolSettings, ServerSettings};
///
/// # fn main() -> pg_ephemeral_clones::Result<()> {
/// let server = EphemeralServer::start(ServerSettings::default())?;
/// let pool = ClonePool::new(
///     server.admin(),
///     server.template(),
///     &PoolSettings::default(),
///     Some(server.locks_dir().to_owned()),
/// );
/// let name = pool.resolve("tests::creates_user")?;
/// assert_eq!(name, pool.resolve("tests::creates_user")?);
/// pool.on_test_boundary();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClonePool {
    cloner: DatabaseCloner,
    cleanup: CleanupPolicy,
}

impl ClonePool {
    /// Builds a pool copying `template` through `admin`. With a
    /// `locks_dir`, creation and removal are also serialised across
    /// processes sharing the server.
    #[must_use]
    pub fn new(
        admin: Arc<dyn DatabaseAdmin>,
        template: impl Into<String>,
        settings: &PoolSettings,
        locks_dir: Option<Utf8PathBuf>,
    ) -> Self {
        let registry = Arc::new(
            locks_dir.map_or_else(CloneRegistry::new, CloneRegistry::with_locks_dir),
        );
        let cloner = DatabaseCloner::new(Arc::clone(&admin), Arc::clone(&registry), template);
        let cleanup = CleanupPolicy::new(admin, registry, settings.cleanup_threshold);
        Self { cloner, cleanup }
    }

    /// Resolves `identity` to its clone.
    ///
    /// # Errors
    /// See [`DatabaseCloner::resolve`].
    pub fn resolve(&self, identity: impl AsRef<[u8]>) -> CloneResult<DatabaseName> {
        self.cloner.resolve(identity)
    }

    /// Resolves a path identity to its clone.
    ///
    /// # Errors
    /// See [`DatabaseCloner::resolve`].
    pub fn resolve_path(&self, path: &Path) -> CloneResult<DatabaseName> {
        self.cloner.resolve_path(path)
    }

    /// Resolves `identity` and leases its clone for as long as the returned
    /// lease lives.
    ///
    /// # Errors
    /// See [`DatabaseCloner::resolve`].
    pub fn lease(&self, identity: impl AsRef<[u8]>) -> CloneResult<CloneLease> {
        self.cloner.lease(identity)
    }

    /// Path-identity variant of [`lease`](Self::lease).
    ///
    /// # Errors
    /// See [`DatabaseCloner::resolve`].
    pub fn lease_path(&self, path: &Path) -> CloneResult<CloneLease> {
        self.cloner.lease_path(path)
    }

    /// Runs the cleanup policy; call once per finished test.
    #[must_use = "the report lists clones that could not be dropped"]
    pub fn on_test_boundary(&self) -> CleanupReport {
        self.cleanup.on_test_boundary()
    }

    /// Returns the tracked clones.
    #[must_use]
    pub fn registry(&self) -> &CloneRegistry {
        self.cloner.registry()
    }

    /// Returns the cloner.
    #[must_use]
    pub const fn cloner(&self) -> &DatabaseCloner {
        &self.cloner
    }

    /// Returns the cleanup policy.
    #[must_use]
    pub const fn cleanup(&self) -> &CleanupPolicy {
        &self.cleanup
    }

    /// Returns the template clones are copied from.
    #[must_use]
    pub fn template(&self) -> &str {
        self.cloner.template()
    }
}
