//! Process-wide bookkeeping of resolved clones.

use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use dashmap::DashMap;

use super::fingerprint::{DatabaseName, Fingerprint};
use super::lock::CloneFileLock;
use crate::error::{CloneError, CloneErrorKind, CloneResult};

/// How a clone came to be tracked by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOrigin {
    /// This process issued the template copy and owns the clone.
    Created,
    /// The database already existed, typically created by a sibling worker
    /// sharing the server. Adopted clones are never dropped here.
    Adopted,
}

/// A resolved clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRecord {
    fingerprint: Fingerprint,
    database_name: DatabaseName,
    origin: CloneOrigin,
}

impl CloneRecord {
    /// Builds a record whose database name is derived from `fingerprint`.
    #[must_use]
    pub fn new(fingerprint: Fingerprint, origin: CloneOrigin) -> Self {
        let database_name = fingerprint.database_name();
        Self {
            fingerprint,
            database_name,
            origin,
        }
    }

    /// Returns the identity fingerprint.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Returns the clone's database name.
    #[must_use]
    pub const fn database_name(&self) -> &DatabaseName {
        &self.database_name
    }

    /// Returns how the clone was obtained.
    #[must_use]
    pub const fn origin(&self) -> CloneOrigin {
        self.origin
    }
}

/// A record plus the number of live leases on it. Leased clones are in use
/// by a running test and must not be dropped.
#[derive(Debug)]
struct TrackedClone {
    record: CloneRecord,
    leases: usize,
}

/// Result of [`CloneRegistry::remove_unleased`].
#[derive(Debug)]
pub(crate) enum Removal {
    /// The record was untracked and is returned to the caller.
    Removed(CloneRecord),
    /// The record is still leased and stays tracked.
    Leased,
    /// Nothing is tracked under the fingerprint.
    Absent,
}

/// Map of fingerprint to [`CloneRecord`] plus the per-fingerprint locks that
/// serialise creation and removal.
///
/// Threads in this process contend on an in-memory mutex per fingerprint.
/// When a locks directory is configured, holders additionally take an
/// exclusive file lock so worker processes sharing the server serialise too.
///
/// Each record carries a lease count. Leases are taken and released on the
/// map entry itself, so a lease either lands before a removal or observes
/// the record as gone.
#[derive(Debug, Default)]
pub struct CloneRegistry {
    records: DashMap<Fingerprint, TrackedClone>,
    locks: DashMap<Fingerprint, Arc<Mutex<()>>>,
    locks_dir: Option<Utf8PathBuf>,
}

impl CloneRegistry {
    /// Creates a registry that only serialises threads of this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that also takes file locks inside `locks_dir`.
    #[must_use]
    pub fn with_locks_dir(locks_dir: Utf8PathBuf) -> Self {
        Self {
            locks_dir: Some(locks_dir),
            ..Self::default()
        }
    }

    /// Returns the record for `fingerprint`, if tracked.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CloneRecord> {
        self.records
            .get(fingerprint)
            .map(|entry| entry.record.clone())
    }

    /// Returns `true` when `fingerprint` is tracked.
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.records.contains_key(fingerprint)
    }

    /// Number of tracked clones, adopted ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of tracked clones this process created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.record.origin == CloneOrigin::Created)
            .count()
    }

    /// Copies the current records, sorted by fingerprint.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CloneRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        records
    }

    /// Number of live leases on `fingerprint`; zero when untracked.
    #[must_use]
    pub fn lease_count(&self, fingerprint: &Fingerprint) -> usize {
        self.records
            .get(fingerprint)
            .map_or(0, |entry| entry.leases)
    }

    /// Tracks `record` without leases, replacing any previous entry.
    pub(crate) fn insert(&self, record: CloneRecord) {
        self.records.insert(
            record.fingerprint.clone(),
            TrackedClone { record, leases: 0 },
        );
    }

    /// Takes a lease on `fingerprint`. Returns `false` when it is untracked.
    pub(crate) fn lease(&self, fingerprint: &Fingerprint) -> bool {
        self.records
            .get_mut(fingerprint)
            .map(|mut entry| entry.leases += 1)
            .is_some()
    }

    /// Returns a lease taken by [`lease`](Self::lease).
    pub(crate) fn release(&self, fingerprint: &Fingerprint) {
        if let Some(mut entry) = self.records.get_mut(fingerprint) {
            entry.leases = entry.leases.saturating_sub(1);
        }
    }

    /// Untracks `fingerprint` unless it is leased.
    pub(crate) fn remove_unleased(&self, fingerprint: &Fingerprint) -> Removal {
        match self
            .records
            .remove_if(fingerprint, |_, tracked| tracked.leases == 0)
        {
            Some((_, tracked)) => Removal::Removed(tracked.record),
            None if self.records.contains_key(fingerprint) => Removal::Leased,
            None => Removal::Absent,
        }
    }

    /// Forgets the in-memory lock for `fingerprint` when no thread holds or
    /// waits on it. Call only after the fingerprint lock has been released.
    ///
    /// Lock files are left in place: unlinking a file another process may
    /// be waiting on would let two holders lock different inodes.
    pub(crate) fn prune_lock(&self, fingerprint: &Fingerprint) {
        self.locks
            .remove_if(fingerprint, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of in-memory fingerprint locks currently kept.
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Runs `f` while holding the locks for `fingerprint`.
    ///
    /// # Errors
    /// Returns a [`CloneError`] of kind `Lock` when the file lock cannot be
    /// taken, or whatever `f` returns.
    pub(crate) fn with_fingerprint_lock<T>(
        &self,
        fingerprint: &Fingerprint,
        f: impl FnOnce() -> CloneResult<T>,
    ) -> CloneResult<T> {
        // Clone the mutex out so the map shard is not held while blocking.
        let mutex = Arc::clone(
            self.locks
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self
            .locks_dir
            .as_ref()
            .map(|dir| {
                CloneFileLock::acquire(dir, fingerprint).map_err(|err| {
                    CloneError::new(
                        CloneErrorKind::Lock,
                        eyre!("failed to lock clone '{fingerprint}' in {dir}: {err}"),
                    )
                })
            })
            .transpose()?;
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn created_count_ignores_adopted_records() {
        let registry = CloneRegistry::new();
        registry.insert(CloneRecord::new(Fingerprint::of("a"), CloneOrigin::Created));
        registry.insert(CloneRecord::new(Fingerprint::of("b"), CloneOrigin::Adopted));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.created_count(), 1);
    }

    #[test]
    fn unleased_record_is_removed() {
        let registry = CloneRegistry::new();
        let fingerprint = Fingerprint::of("a");
        registry.insert(CloneRecord::new(fingerprint.clone(), CloneOrigin::Created));
        let Removal::Removed(removed) = registry.remove_unleased(&fingerprint) else {
            panic!("expected the record to be removed");
        };
        assert_eq!(removed.database_name(), fingerprint.as_str());
        assert!(registry.is_empty());
        assert!(matches!(registry.remove_unleased(&fingerprint), Removal::Absent));
    }

    #[test]
    fn leased_record_survives_removal_until_released() {
        let registry = CloneRegistry::new();
        let fingerprint = Fingerprint::of("a");
        registry.insert(CloneRecord::new(fingerprint.clone(), CloneOrigin::Created));
        assert!(registry.lease(&fingerprint));
        assert!(registry.lease(&fingerprint));
        assert_eq!(registry.lease_count(&fingerprint), 2);

        assert!(matches!(registry.remove_unleased(&fingerprint), Removal::Leased));
        registry.release(&fingerprint);
        assert!(matches!(registry.remove_unleased(&fingerprint), Removal::Leased));
        registry.release(&fingerprint);
        assert!(matches!(registry.remove_unleased(&fingerprint), Removal::Removed(_)));
    }

    #[test]
    fn leasing_an_untracked_fingerprint_fails() {
        let registry = CloneRegistry::new();
        assert!(!registry.lease(&Fingerprint::of("missing")));
        assert_eq!(registry.lease_count(&Fingerprint::of("missing")), 0);
    }

    #[test]
    fn idle_locks_are_pruned() {
        let registry = CloneRegistry::new();
        let fingerprint = Fingerprint::of("a");
        registry
            .with_fingerprint_lock(&fingerprint, || Ok(()))
            .expect("locked section");
        assert_eq!(registry.lock_count(), 1);
        registry.prune_lock(&fingerprint);
        assert_eq!(registry.lock_count(), 0);
    }

    #[test]
    fn held_locks_are_not_pruned() {
        let registry = CloneRegistry::new();
        let fingerprint = Fingerprint::of("a");
        registry
            .with_fingerprint_lock(&fingerprint, || {
                registry.prune_lock(&fingerprint);
                Ok(())
            })
            .expect("locked section");
        assert_eq!(registry.lock_count(), 1);
    }

    #[test]
    fn fingerprint_lock_serialises_threads() {
        let registry = Arc::new(CloneRegistry::new());
        let fingerprint = Fingerprint::of("shared");
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let fingerprint = fingerprint.clone();
                let inside = Arc::clone(&inside);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    registry
                        .with_fingerprint_lock(&fingerprint, || {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlap.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(20));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("locked section");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn file_lock_is_taken_when_a_locks_dir_is_configured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("locks")).expect("utf8");
        let registry = CloneRegistry::with_locks_dir(dir.clone());
        let fingerprint = Fingerprint::of("a");
        registry
            .with_fingerprint_lock(&fingerprint, || Ok(()))
            .expect("locked section");
        assert!(dir.join(format!("{fingerprint}.lock")).exists());
    }
}
