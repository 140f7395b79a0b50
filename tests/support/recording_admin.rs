//! In-memory [`DatabaseAdmin`] that records every call.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use color_eyre::eyre::eyre;
use pg_ephemeral_clones::{CloneError, CloneErrorKind, CloneResult, DatabaseAdmin};

/// Tracks databases like a server would and counts clone and drop calls.
#[derive(Debug, Default)]
pub struct RecordingAdmin {
    databases: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    busy: Mutex<BTreeSet<String>>,
    clone_delay: Option<Duration>,
}

impl RecordingAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slows every clone down so concurrent callers overlap.
    pub fn with_clone_delay(delay: Duration) -> Self {
        Self {
            clone_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Pretends `name` already exists on the server.
    pub fn seed(&self, name: &str) {
        lock(&self.databases).insert(name.to_owned());
    }

    /// Makes drops of `name` fail as if a connection were still open.
    pub fn mark_busy(&self, name: &str) {
        lock(&self.busy).insert(name.to_owned());
    }

    pub fn release(&self, name: &str) {
        lock(&self.busy).remove(name);
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.databases).contains(name)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.starts_with(operation))
            .count()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DatabaseAdmin for RecordingAdmin {
    fn create_database(&self, name: &str) -> CloneResult<()> {
        self.record(format!("create {name}"));
        if !lock(&self.databases).insert(name.to_owned()) {
            return Err(CloneError::new(
                CloneErrorKind::Create,
                eyre!("database \"{name}\" already exists"),
            ));
        }
        Ok(())
    }

    fn clone_database(&self, name: &str, template: &str) -> CloneResult<()> {
        self.record(format!("clone {name} from {template}"));
        if let Some(delay) = self.clone_delay {
            thread::sleep(delay);
        }
        if !lock(&self.databases).insert(name.to_owned()) {
            return Err(CloneError::new(
                CloneErrorKind::Create,
                eyre!("database \"{name}\" already exists"),
            ));
        }
        Ok(())
    }

    fn drop_database(&self, name: &str) -> CloneResult<()> {
        self.record(format!("drop {name}"));
        if lock(&self.busy).contains(name) {
            return Err(CloneError::new(
                CloneErrorKind::Drop,
                eyre!("database \"{name}\" is being accessed by other users"),
            ));
        }
        lock(&self.databases).remove(name);
        Ok(())
    }

    fn database_exists(&self, name: &str) -> CloneResult<bool> {
        Ok(self.exists(name))
    }
}
