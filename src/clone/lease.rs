//! Leases that keep a clone alive while a test uses it.

use std::sync::Arc;

use super::fingerprint::{DatabaseName, Fingerprint};
use super::registry::CloneRegistry;

/// A running test's claim on its clone.
///
/// While any lease on a fingerprint is alive, [`CleanupPolicy`] skips that
/// clone. Dropping the lease returns it.
///
/// [`CleanupPolicy`]: super::CleanupPolicy
#[derive(Debug)]
pub struct CloneLease {
    registry: Arc<CloneRegistry>,
    fingerprint: Fingerprint,
    database_name: DatabaseName,
}

impl CloneLease {
    /// Wraps a lease already counted in `registry`.
    pub(crate) fn new(registry: Arc<CloneRegistry>, fingerprint: Fingerprint) -> Self {
        let database_name = fingerprint.database_name();
        Self {
            registry,
            fingerprint,
            database_name,
        }
    }

    /// Returns the leased clone's database name.
    #[must_use]
    pub const fn database_name(&self) -> &DatabaseName {
        &self.database_name
    }

    /// Returns the leased clone's fingerprint.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for CloneLease {
    fn drop(&mut self) {
        self.registry.release(&self.fingerprint);
    }
}
