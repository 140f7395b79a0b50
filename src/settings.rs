//! Resolved settings consumed by the server supervisor and the clone pool.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::admin::AdminKind;

/// Template database created once per server and used as the clone source.
pub const DEFAULT_TEMPLATE: &str = "template_clone_source";

/// Number of created clones that triggers a batched drop pass.
pub const DEFAULT_CLEANUP_THRESHOLD: usize = 10;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_SUPERUSER: &str = "postgres";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings for the ephemeral server process and its client utilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Directory holding the `PostgreSQL` binaries; `PATH` is searched when
    /// `None`.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Bind and connect host. Defaults to `localhost`.
    pub host: String,
    /// Superuser created by `initdb`. Defaults to `postgres`.
    pub superuser: String,
    /// Template database name. Defaults to [`DEFAULT_TEMPLATE`].
    pub template: String,
    /// Readiness budget. Defaults to 60 seconds.
    pub ready_timeout: Duration,
    /// Grace period after `SIGTERM` before the server is killed. Defaults to
    /// 15 seconds.
    pub shutdown_timeout: Duration,
    /// Budget for each `initdb`/`createdb`/`dropdb`/`psql` call. Defaults to
    /// 120 seconds.
    pub command_timeout: Duration,
    /// Implementation used for database administration.
    pub admin: AdminKind,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bin_dir: None,
            host: DEFAULT_HOST.to_owned(),
            superuser: DEFAULT_SUPERUSER.to_owned(),
            template: DEFAULT_TEMPLATE.to_owned(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            admin: AdminKind::default(),
        }
    }
}

/// Settings for the clone pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Created-clone count at which the next test boundary drops clones.
    pub cleanup_threshold: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cleanup_threshold: DEFAULT_CLEANUP_THRESHOLD,
        }
    }
}

/// Everything a [`TestSession`](crate::TestSession) needs to start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Server process settings.
    pub server: ServerSettings,
    /// Clone pool settings.
    pub pool: PoolSettings,
}
