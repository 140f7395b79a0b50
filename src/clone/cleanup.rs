//! Batched removal of clones at test boundaries.

use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use super::fingerprint::DatabaseName;
use super::registry::{CloneOrigin, CloneRegistry, Removal};
use crate::admin::DatabaseAdmin;
use crate::observability::LOG_TARGET;
use crate::settings::DEFAULT_CLEANUP_THRESHOLD;

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Clones dropped and forgotten.
    pub dropped: Vec<DatabaseName>,
    /// Clones whose drop failed; they stay tracked for a later pass.
    pub retained: Vec<DatabaseName>,
    /// Clones skipped because a running test still leases them.
    pub leased: Vec<DatabaseName>,
}

impl CleanupReport {
    /// Returns `true` when the pass did nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty() && self.retained.is_empty() && self.leased.is_empty()
    }
}

enum DropOutcome {
    Dropped,
    Leased,
    Gone,
}

/// Drops created clones once their number reaches a threshold.
///
/// Batching keeps the per-test cost low: most boundaries are a count check,
/// and drops happen in bulk every `threshold` clones.
#[derive(Clone)]
pub struct CleanupPolicy {
    admin: Arc<dyn DatabaseAdmin>,
    registry: Arc<CloneRegistry>,
    threshold: usize,
}

impl std::fmt::Debug for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupPolicy")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl CleanupPolicy {
    /// Creates a policy dropping clones through `admin` once `registry`
    /// tracks `threshold` created clones. A zero threshold is treated as the
    /// default.
    #[must_use]
    pub fn new(admin: Arc<dyn DatabaseAdmin>, registry: Arc<CloneRegistry>, threshold: usize) -> Self {
        Self {
            admin,
            registry,
            threshold: if threshold == 0 {
                DEFAULT_CLEANUP_THRESHOLD
            } else {
                threshold
            },
        }
    }

    /// Returns the number of created clones that triggers a cleanup pass.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Runs at the end of each test. Below the threshold this is a no-op;
    /// otherwise every created clone without a live lease is dropped under
    /// its fingerprint lock. Drop failures are logged and the clone is
    /// retained. Nothing is ever raised.
    #[must_use = "the report lists clones that could not be dropped"]
    pub fn on_test_boundary(&self) -> CleanupReport {
        let created = self.registry.created_count();
        if created < self.threshold {
            debug!(
                target: LOG_TARGET,
                created,
                threshold = self.threshold,
                "clone cleanup not due"
            );
            return CleanupReport::default();
        }

        let _span = info_span!(target: LOG_TARGET, "cleanup_clones", created).entered();
        let mut report = CleanupReport::default();
        let candidates = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|record| record.origin() == CloneOrigin::Created);
        for candidate in candidates {
            let fingerprint = candidate.fingerprint().clone();
            let name = candidate.database_name().clone();
            let outcome = self.registry.with_fingerprint_lock(&fingerprint, || {
                // Untracked first so no new lease lands while the drop runs.
                let record = match self.registry.remove_unleased(&fingerprint) {
                    Removal::Removed(record) => record,
                    Removal::Leased => return Ok(DropOutcome::Leased),
                    Removal::Absent => return Ok(DropOutcome::Gone),
                };
                self.admin.drop_database(name.as_str()).inspect_err(|_| {
                    self.registry.insert(record);
                })?;
                Ok(DropOutcome::Dropped)
            });
            match outcome {
                Ok(DropOutcome::Dropped) => {
                    self.registry.prune_lock(&fingerprint);
                    report.dropped.push(name);
                }
                Ok(DropOutcome::Leased) => {
                    debug!(target: LOG_TARGET, db = %name, "clone still leased; keeping it");
                    report.leased.push(name);
                }
                Ok(DropOutcome::Gone) => {}
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        db = %name,
                        error = %err,
                        "failed to drop clone; retaining it"
                    );
                    report.retained.push(name);
                }
            }
        }
        info!(
            target: LOG_TARGET,
            dropped = report.dropped.len(),
            retained = report.retained.len(),
            leased = report.leased.len(),
            "clone cleanup finished"
        );
        report
    }
}
