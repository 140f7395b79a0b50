//! Resolves per-test identities into template clones.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, info_span};

use super::fingerprint::{DatabaseName, Fingerprint};
use super::lease::CloneLease;
use super::registry::{CloneOrigin, CloneRecord, CloneRegistry};
use crate::admin::DatabaseAdmin;
use crate::error::CloneResult;
use crate::observability::LOG_TARGET;

/// Maps a test identity to its own database, copying the template the first
/// time an identity is seen.
#[derive(Clone)]
pub struct DatabaseCloner {
    admin: Arc<dyn DatabaseAdmin>,
    registry: Arc<CloneRegistry>,
    template: String,
}

impl std::fmt::Debug for DatabaseCloner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCloner")
            .field("template", &self.template)
            .field("tracked", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DatabaseCloner {
    /// Creates a cloner that copies `template` through `admin` and records
    /// results in `registry`.
    #[must_use]
    pub fn new(
        admin: Arc<dyn DatabaseAdmin>,
        registry: Arc<CloneRegistry>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            admin,
            registry,
            template: template.into(),
        }
    }

    /// Returns the template every clone is copied from.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Returns the registry this cloner records into.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CloneRegistry> {
        &self.registry
    }

    /// Returns the database name for `identity`, cloning the template when
    /// no database exists for it yet.
    ///
    /// Repeated calls with the same identity return the same name without
    /// issuing another copy. Concurrent callers resolving the same identity
    /// observe exactly one creation.
    ///
    /// The name is not protected from cleanup; callers that keep using the
    /// clone should hold a [`lease`](Self::lease) instead.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) when the lock cannot be
    /// taken, the existence probe fails, or the template copy is rejected.
    pub fn resolve(&self, identity: impl AsRef<[u8]>) -> CloneResult<DatabaseName> {
        let fingerprint = Fingerprint::of(identity);
        self.resolve_fingerprint(&fingerprint, false)?;
        Ok(fingerprint.database_name())
    }

    /// Resolves a filesystem path identity, typically the test's working
    /// directory.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn resolve_path(&self, path: &Path) -> CloneResult<DatabaseName> {
        let fingerprint = Fingerprint::of_path(path);
        self.resolve_fingerprint(&fingerprint, false)?;
        Ok(fingerprint.database_name())
    }

    /// Resolves `identity` like [`resolve`](Self::resolve) and leases the
    /// clone so cleanup leaves it alone until the lease drops.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn lease(&self, identity: impl AsRef<[u8]>) -> CloneResult<CloneLease> {
        self.lease_fingerprint(Fingerprint::of(identity))
    }

    /// Path-identity variant of [`lease`](Self::lease).
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn lease_path(&self, path: &Path) -> CloneResult<CloneLease> {
        self.lease_fingerprint(Fingerprint::of_path(path))
    }

    fn lease_fingerprint(&self, fingerprint: Fingerprint) -> CloneResult<CloneLease> {
        self.resolve_fingerprint(&fingerprint, true)?;
        Ok(CloneLease::new(Arc::clone(&self.registry), fingerprint))
    }

    /// Makes sure a clone for `fingerprint` is tracked, taking a lease on it
    /// when `leased` is set.
    fn resolve_fingerprint(&self, fingerprint: &Fingerprint, leased: bool) -> CloneResult<()> {
        let reuse = || {
            let tracked = if leased {
                self.registry.lease(fingerprint)
            } else {
                self.registry.contains(fingerprint)
            };
            if tracked {
                debug!(target: LOG_TARGET, db = %fingerprint, "reusing clone");
            }
            tracked
        };
        if reuse() {
            return Ok(());
        }

        self.registry.with_fingerprint_lock(fingerprint, || {
            if reuse() {
                return Ok(());
            }

            let name = fingerprint.database_name();
            let origin = if self.admin.database_exists(name.as_str())? {
                debug!(target: LOG_TARGET, db = %name, "adopting existing clone");
                CloneOrigin::Adopted
            } else {
                let _span = info_span!(
                    target: LOG_TARGET,
                    "create_clone",
                    db = %name,
                    template = %self.template
                )
                .entered();
                self.admin.clone_database(name.as_str(), &self.template)?;
                info!(target: LOG_TARGET, db = %name, "created clone");
                CloneOrigin::Created
            };
            self.registry
                .insert(CloneRecord::new(fingerprint.clone(), origin));
            if leased {
                self.registry.lease(fingerprint);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MockDatabaseAdmin;
    use crate::error::{CloneError, CloneErrorKind};
    use color_eyre::eyre::eyre;
    use mockall::predicate::{always, eq};
    use std::thread;
    use std::time::Duration;

    const TEMPLATE: &str = "template_clone_source";

    fn cloner(admin: MockDatabaseAdmin) -> DatabaseCloner {
        DatabaseCloner::new(Arc::new(admin), Arc::new(CloneRegistry::new()), TEMPLATE)
    }

    #[test]
    fn repeated_identity_clones_once() {
        let expected = Fingerprint::of("test-A").database_name();
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().times(1).returning(|_| Ok(false));
        admin
            .expect_clone_database()
            .with(eq(expected.as_str().to_owned()), eq(TEMPLATE))
            .times(1)
            .returning(|_, _| Ok(()));
        let cloner = cloner(admin);

        let first = cloner.resolve("test-A").expect("first resolve");
        let second = cloner.resolve("test-A").expect("second resolve");

        assert_eq!(first, expected);
        assert_eq!(first, second);
        assert_eq!(cloner.registry().created_count(), 1);
    }

    #[test]
    fn distinct_identities_get_distinct_clones() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().times(2).returning(|_| Ok(false));
        admin
            .expect_clone_database()
            .with(always(), eq(TEMPLATE))
            .times(2)
            .returning(|_, _| Ok(()));
        let cloner = cloner(admin);

        let a = cloner.resolve("test-A").expect("resolve A");
        let b = cloner.resolve("test-B").expect("resolve B");
        assert_ne!(a, b);
    }

    #[test]
    fn existing_database_is_adopted_without_copy() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().times(1).returning(|_| Ok(true));
        admin.expect_clone_database().never();
        let cloner = cloner(admin);

        cloner.resolve("test-A").expect("resolve");
        let record = cloner
            .registry()
            .get(&Fingerprint::of("test-A"))
            .expect("tracked");
        assert_eq!(record.origin(), CloneOrigin::Adopted);
        assert_eq!(cloner.registry().created_count(), 0);
    }

    #[test]
    fn failed_copy_is_not_recorded() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().returning(|_| Ok(false));
        admin
            .expect_clone_database()
            .times(1)
            .returning(|_, _| Err(CloneError::new(CloneErrorKind::Create, eyre!("template busy"))));
        let cloner = cloner(admin);

        let err = cloner.resolve("test-A").expect_err("copy fails");
        assert_eq!(err.kind(), CloneErrorKind::Create);
        assert!(cloner.registry().is_empty());
    }

    #[test]
    fn leases_are_counted_per_holder() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().times(1).returning(|_| Ok(false));
        admin.expect_clone_database().times(1).returning(|_, _| Ok(()));
        let cloner = cloner(admin);
        let fingerprint = Fingerprint::of("test-A");

        let first = cloner.lease("test-A").expect("first lease");
        let second = cloner.lease("test-A").expect("second lease");
        assert_eq!(first.database_name(), second.database_name());
        assert_eq!(cloner.registry().lease_count(&fingerprint), 2);

        drop(first);
        assert_eq!(cloner.registry().lease_count(&fingerprint), 1);
        drop(second);
        assert_eq!(cloner.registry().lease_count(&fingerprint), 0);
        assert!(cloner.registry().contains(&fingerprint));
    }

    #[test]
    fn failed_copy_takes_no_lease() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().returning(|_| Ok(false));
        admin
            .expect_clone_database()
            .returning(|_, _| Err(CloneError::new(CloneErrorKind::Create, eyre!("disk full"))));
        let cloner = cloner(admin);

        assert!(cloner.lease("test-A").is_err());
        assert_eq!(cloner.registry().lease_count(&Fingerprint::of("test-A")), 0);
    }

    #[test]
    fn concurrent_resolution_creates_once() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_database_exists().times(1).returning(|_| Ok(false));
        admin.expect_clone_database().times(1).returning(|_, _| {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        });
        let cloner = cloner(admin);

        let names: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| cloner.resolve("test-X").expect("resolve")))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("resolver thread"))
                .collect()
        });

        assert!(names.iter().all(|name| Some(name) == names.first()));
        assert_eq!(cloner.registry().len(), 1);
    }
}
