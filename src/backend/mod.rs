//! Explicit injection of template clones into a component's storage
//! backend.
//!
//! A component under test obtains its storage through a [`BackendProvider`].
//! [`BackendInjector::provider`] wraps that provider so every descriptor it
//! returns carries a [`StorageFactory`] whose backends resolve their database
//! through the session's [`ClonePool`]. Nothing global is mutated; callers
//! hand the wrapped provider to the component themselves.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::{Map, Value};
use tracing::debug;

use crate::clone::{CloneLease, ClonePool, DatabaseName};
use crate::error::CloneResult;
use crate::observability::LOG_TARGET;
use crate::server::ConnectionSettings;

/// A storage backend instance bound to one base directory.
pub trait StorageBackend: Send + Sync {
    /// Returns the database this backend stores into.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) when the database cannot
    /// be provisioned.
    fn database(&self) -> CloneResult<DatabaseName>;

    /// Returns the server connection, when the backend is server-backed.
    fn connection(&self) -> Option<&ConnectionSettings>;

    /// Returns the base directory the backend was opened for.
    fn basedir(&self) -> &Path;
}

/// Opens storage backends.
pub trait StorageFactory: Send + Sync {
    /// Opens a backend for `basedir`.
    fn open(&self, basedir: &Path) -> Box<dyn StorageBackend>;

    /// Short name used in diagnostics.
    fn name(&self) -> &str;
}

/// Describes a storage backend a component can use.
#[derive(Clone)]
pub struct BackendDescriptor {
    /// Backend name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Factory opening backend instances.
    pub storage: Arc<dyn StorageFactory>,
    /// Backend-specific options, passed through untouched.
    pub options: Map<String, Value>,
}

impl BackendDescriptor {
    /// Creates a descriptor without options.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        storage: Arc<dyn StorageFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            storage,
            options: Map::new(),
        }
    }

    /// Adds an option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("storage", &self.storage.name())
            .field("options", &self.options)
            .finish()
    }
}

/// Produces backend descriptors, optionally tuned by settings.
pub trait BackendProvider: Send + Sync {
    /// Returns the descriptor for the given settings.
    fn backend(&self, settings: Option<&Value>) -> BackendDescriptor;
}

/// Storage whose database is a template clone resolved from its base
/// directory.
///
/// The database is computed on the first [`database`](StorageBackend::database)
/// call and cached for the lifetime of the value. Concurrent first calls
/// serialise on an internal mutex, so resolution happens once. The storage
/// leases its clone, so cleanup passes skip it until the storage is dropped.
pub struct ClonedStorage {
    basedir: PathBuf,
    pool: ClonePool,
    connection: ConnectionSettings,
    lease: Mutex<Option<CloneLease>>,
}

impl ClonedStorage {
    /// Creates storage for `basedir` resolving clones through `pool`.
    #[must_use]
    pub fn new(basedir: impl Into<PathBuf>, pool: ClonePool, connection: ConnectionSettings) -> Self {
        Self {
            basedir: basedir.into(),
            pool,
            connection,
            lease: Mutex::new(None),
        }
    }
}

impl fmt::Debug for ClonedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClonedStorage")
            .field("basedir", &self.basedir)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl StorageBackend for ClonedStorage {
    fn database(&self) -> CloneResult<DatabaseName> {
        let mut cached = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lease) = cached.as_ref() {
            return Ok(lease.database_name().clone());
        }
        let lease = self.pool.lease_path(&self.basedir)?;
        let name = lease.database_name().clone();
        *cached = Some(lease);
        Ok(name)
    }

    fn connection(&self) -> Option<&ConnectionSettings> {
        Some(&self.connection)
    }

    fn basedir(&self) -> &Path {
        &self.basedir
    }
}

#[derive(Debug, Clone)]
struct ClonedStorageFactory {
    pool: ClonePool,
    connection: ConnectionSettings,
}

impl StorageFactory for ClonedStorageFactory {
    fn open(&self, basedir: &Path) -> Box<dyn StorageBackend> {
        Box::new(ClonedStorage::new(
            basedir,
            self.pool.clone(),
            self.connection.clone(),
        ))
    }

    fn name(&self) -> &str {
        "cloned-postgresql"
    }
}

struct InjectedProvider {
    inner: Arc<dyn BackendProvider>,
    storage: Arc<dyn StorageFactory>,
}

impl BackendProvider for InjectedProvider {
    fn backend(&self, settings: Option<&Value>) -> BackendDescriptor {
        BackendDescriptor {
            storage: Arc::clone(&self.storage),
            ..self.inner.backend(settings)
        }
    }
}

/// Wraps backend providers so their storage resolves template clones.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
///
/// use pg_ephemeral_clones::{BackendProvider, SessionSettings, StorageBackend, TestSession};
///
/// # fn main() -> pg_ephemeral_clones::Result<()> {
/// # fn component_provider() -> Arc<dyn BackendProvider> { unimplemented!() }
/// let session = TestSession::start(SessionSettings::default())?;
/// let provider = session.injector().provider(component_provider());
/// let storage = provider.backend(None).storage.open(Path::new("/tmp/test-a"));
/// let database = storage.database()?;
/// # let _ = database;
/// # Ok(())
/// # }
/// ```
pub struct BackendInjector {
    pool: ClonePool,
    connection: ConnectionSettings,
    wrapped: OnceLock<Arc<dyn BackendProvider>>,
}

impl fmt::Debug for BackendInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendInjector")
            .field("connection", &self.connection)
            .field("installed", &self.wrapped.get().is_some())
            .finish_non_exhaustive()
    }
}

impl BackendInjector {
    /// Creates an injector handing out clones from `pool` on the server
    /// reached through `connection`.
    #[must_use]
    pub const fn new(pool: ClonePool, connection: ConnectionSettings) -> Self {
        Self {
            pool,
            connection,
            wrapped: OnceLock::new(),
        }
    }

    /// Returns the wrapped provider, building it from `inner` on the first
    /// call. Later calls return the same wrapper and ignore `inner`.
    #[must_use]
    pub fn provider(&self, inner: Arc<dyn BackendProvider>) -> Arc<dyn BackendProvider> {
        let mut installed = false;
        let wrapped = self.wrapped.get_or_init(|| {
            installed = true;
            let storage: Arc<dyn StorageFactory> = Arc::new(ClonedStorageFactory {
                pool: self.pool.clone(),
                connection: self.connection.clone(),
            });
            Arc::new(InjectedProvider { inner, storage })
        });
        if !installed {
            debug!(target: LOG_TARGET, "backend provider already wrapped; reusing it");
        }
        Arc::clone(wrapped)
    }

    /// Opens cloned storage for `basedir` directly, bypassing any provider.
    #[must_use]
    pub fn open(&self, basedir: &Path) -> ClonedStorage {
        ClonedStorage::new(basedir, self.pool.clone(), self.connection.clone())
    }
}
