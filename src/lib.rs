//! Provisions a throwaway `PostgreSQL` server for a test run and hands each
//! test its own database, cloned cheaply from a template.
//!
//! The library owns the lifecycle of the disposable server (data directory,
//! low-durability configuration, process supervision, readiness polling and
//! teardown), resolves per-test identities into template clones, and bounds
//! the number of live clones with a batched cleanup policy.
//!
//! # Examples
//! ```no_run
//! use pg_ephemeral_clones::{PgEphemeralCfg, with_session};
//!
//! # fn main() -> pg_ephemeral_clones::Result<()> {
//! let settings = PgEphemeralCfg::default().to_settings()?;
//! with_session(settings, |session| -> pg_ephemeral_clones::Result<()> {
//!     let database = session.database_for("/tmp/test-workdir")?;
//!     let url = session.connection().database_url(database.name().as_str());
//!     // ... run the test against `url` ...
//!     # let _ = url;
//!     Ok(())
//! })??;
//! # Ok(())
//! # }
//! ```

mod admin;
mod backend;
mod clone;
mod error;
mod observability;
mod server;
mod session;
mod settings;
#[doc(hidden)]
pub mod test_support;

pub use admin::{AdminKind, ClientAdmin, CommandLineAdmin, DatabaseAdmin};
pub use backend::{
    BackendDescriptor, BackendInjector, BackendProvider, ClonedStorage, StorageBackend,
    StorageFactory,
};
pub use clone::{
    CleanupPolicy, CleanupReport, CloneLease, CloneOrigin, ClonePool, CloneRecord, CloneRegistry,
    DatabaseCloner, DatabaseName, Fingerprint,
};
pub use error::{
    CloneError, CloneErrorKind, CloneResult, ConfigError, PgEphemeralError as Error,
    ProvisionError, ProvisionStep, ResourceError, Result, TimeoutError,
};
pub use server::{
    ConnectionSettings, EphemeralServer, ReadinessWaiter, ServerHandle, allocate_port,
    wait_for_port,
};
pub use session::{TestBoundary, TestDatabase, TestSession, with_session};
pub use settings::{
    DEFAULT_CLEANUP_THRESHOLD, DEFAULT_TEMPLATE, PoolSettings, ServerSettings, SessionSettings,
};

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;

/// Captures harness settings supplied via `PG_EPHEMERAL_*` environment
/// variables.
///
/// # Examples
/// ```
/// use pg_ephemeral_clones::PgEphemeralCfg;
///
/// let cfg = PgEphemeralCfg::default();
/// assert!(cfg.cleanup_threshold.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "PG_EPHEMERAL")]
pub struct PgEphemeralCfg {
    /// Directory holding `initdb`, `postgres`, `createdb`, `dropdb` and `psql`.
    /// The binaries are looked up on `PATH` when unset.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Host the server binds to and clients connect to.
    pub host: Option<String>,
    /// Superuser created by `initdb` and used by every client utility.
    pub superuser: Option<String>,
    /// Name of the template database clones are copied from.
    pub template: Option<String>,
    /// Seconds to wait for the server to accept connections.
    pub ready_timeout_secs: Option<u64>,
    /// Seconds granted to the server to exit after `SIGTERM`.
    pub shutdown_timeout_secs: Option<u64>,
    /// Seconds allowed for each client utility invocation.
    pub command_timeout_secs: Option<u64>,
    /// Number of created clones that triggers a batched drop pass.
    pub cleanup_threshold: Option<usize>,
    /// Admin implementation: `cli` (client utilities) or `client` (SQL).
    pub admin: Option<String>,
}

impl PgEphemeralCfg {
    /// Loads configuration from environment variables without parsing CLI arguments.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a variable cannot be parsed.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("pg-ephemeral-clones")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Converts the configuration into validated [`SessionSettings`].
    ///
    /// Unset values fall back to the defaults documented on
    /// [`ServerSettings`] and [`PoolSettings`].
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a timeout or the cleanup threshold is
    /// zero, or when `admin` names an unknown implementation.
    pub fn to_settings(&self) -> ConfigResult<SessionSettings> {
        let mut server = ServerSettings::default();
        self.apply_connection(&mut server);
        self.apply_timeouts(&mut server)?;
        self.apply_admin(&mut server)?;
        server.bin_dir.clone_from(&self.bin_dir);

        let mut pool = PoolSettings::default();
        if let Some(threshold) = self.cleanup_threshold {
            if threshold == 0 {
                return Err(ConfigError::from(eyre!(
                    "PG_EPHEMERAL_CLEANUP_THRESHOLD must be at least 1"
                )));
            }
            pool.cleanup_threshold = threshold;
        }

        Ok(SessionSettings { server, pool })
    }

    fn apply_connection(&self, settings: &mut ServerSettings) {
        if let Some(ref host) = self.host {
            settings.host.clone_from(host);
        }
        if let Some(ref user) = self.superuser {
            settings.superuser.clone_from(user);
        }
        if let Some(ref template) = self.template {
            settings.template.clone_from(template);
        }
    }

    fn apply_timeouts(&self, settings: &mut ServerSettings) -> ConfigResult<()> {
        if let Some(secs) = self.ready_timeout_secs {
            settings.ready_timeout = non_zero_secs("PG_EPHEMERAL_READY_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            settings.shutdown_timeout =
                non_zero_secs("PG_EPHEMERAL_SHUTDOWN_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = self.command_timeout_secs {
            settings.command_timeout = non_zero_secs("PG_EPHEMERAL_COMMAND_TIMEOUT_SECS", secs)?;
        }
        Ok(())
    }

    fn apply_admin(&self, settings: &mut ServerSettings) -> ConfigResult<()> {
        if let Some(ref admin) = self.admin {
            settings.admin = admin.parse()?;
        }
        Ok(())
    }
}

fn non_zero_secs(name: &str, secs: u64) -> ConfigResult<Duration> {
    if secs == 0 {
        return Err(ConfigError::from(eyre!("{name} must be at least 1 second")));
    }
    Ok(Duration::from_secs(secs))
}
