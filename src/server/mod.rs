//! Supervisor for a throwaway `PostgreSQL` server.
//!
//! [`EphemeralServer::start`] creates a private temporary directory, runs
//! `initdb`, appends a low-durability configuration overlay, launches
//! `postgres` on a freshly allocated port, waits for the listener, and creates
//! the template database. The server stops and its directory disappears when
//! [`EphemeralServer::stop`] runs or the value drops, including on the error
//! paths of `start` itself.
//!
//! ```no_run
//! use pg_ephemeral_clones::{EphemeralServer, ServerSettings};
//!
//! # fn main() -> pg_ephemeral_clones::Result<()> {
//! let mut server = EphemeralServer::start(ServerSettings::default())?;
//! let url = server.connection().database_url("postgres");
//! // ... talk to the server ...
//! # let _ = url;
//! server.stop();
//! # Ok(())
//! # }
//! ```

mod command;
mod connection;
mod data_dir;
pub(crate) mod exit_hook;
mod port;
mod readiness;
mod shutdown;

pub use self::connection::ConnectionSettings;
pub use self::port::allocate_port;
pub use self::readiness::{ReadinessWaiter, wait_for_port};

pub(crate) use self::command::{Toolchain, run_utility};

use std::fs::File;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{info, info_span, warn};

use self::command::log_tail;
use self::data_dir::ServerDataDir;
use self::readiness::ReadinessFailure;
use crate::admin::{self, DatabaseAdmin};
use crate::error::{ProvisionError, ProvisionStep, Result};
use crate::observability::LOG_TARGET;
use crate::settings::ServerSettings;

/// The running server process and where it listens.
#[derive(Debug)]
pub struct ServerHandle {
    data_dir: Utf8PathBuf,
    host: String,
    port: u16,
    process: Child,
}

impl ServerHandle {
    /// Returns the cluster data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Returns the bind host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the bind port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the OS process identifier of the postmaster.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }
}

/// Process and directory that must be released together. Dropping a
/// `RunningServer` terminates the process before removing the directory.
#[derive(Debug)]
struct RunningServer {
    handle: ServerHandle,
    dir: Option<ServerDataDir>,
    shutdown_timeout: Duration,
    released: bool,
}

impl RunningServer {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _span = info_span!(target: LOG_TARGET, "stop_server", port = self.handle.port)
            .entered();
        match shutdown::terminate(&mut self.handle.process, self.shutdown_timeout) {
            Ok(status) => info!(target: LOG_TARGET, %status, "ephemeral server stopped"),
            Err(err) => warn!(
                target: LOG_TARGET,
                error = %err,
                "failed to stop ephemeral server"
            ),
        }
        if let Some(dir) = self.dir.take() {
            remove_dir(dir);
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.release();
    }
}

fn remove_dir(dir: ServerDataDir) {
    let root = dir.root_path().to_owned();
    match dir.close() {
        Ok(()) => info!(target: LOG_TARGET, path = %root, "removed server directory"),
        Err(err) => warn!(
            target: LOG_TARGET,
            path = %root,
            error = %err,
            "failed to remove server directory"
        ),
    }
}

/// Throwaway `PostgreSQL` server whose lifecycle follows Rust's drop
/// semantics.
pub struct EphemeralServer {
    settings: ServerSettings,
    connection: ConnectionSettings,
    admin: Arc<dyn DatabaseAdmin>,
    locks_dir: Utf8PathBuf,
    root: Utf8PathBuf,
    running: Option<RunningServer>,
    // Keeps the server span alive for the lifetime of the guard.
    _server_span: tracing::Span,
}

impl std::fmt::Debug for EphemeralServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralServer")
            .field("connection", &self.connection)
            .field("root", &self.root)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl EphemeralServer {
    /// Provisions and starts a server, blocking until it accepts connections
    /// and the template database exists.
    ///
    /// # Errors
    /// - [`ResourceError`](crate::ResourceError) when no port can be bound.
    /// - [`ProvisionError`] naming the failed step (`init`, `configure`,
    ///   `start`, `template`).
    /// - [`TimeoutError`](crate::TimeoutError) when the server is not
    ///   reachable within `ready_timeout`.
    ///
    /// The process is terminated and the temporary directory removed before
    /// any error is returned.
    pub fn start(settings: ServerSettings) -> Result<Self> {
        let span = info_span!(target: LOG_TARGET, "ephemeral_server", host = %settings.host);
        let (running, connection, admin, locks_dir, root) = {
            let _entered = span.enter();
            let toolchain = Toolchain::new(settings.bin_dir.clone());
            let dir = ServerDataDir::create()
                .map_err(|report| ProvisionError::new(ProvisionStep::Init, report))?;
            run_initdb(&toolchain, &settings, &dir)?;
            dir.write_overlay()
                .map_err(|report| ProvisionError::new(ProvisionStep::Configure, report))?;

            let port = allocate_port(&settings.host)?;
            let process = launch_postgres(&toolchain, &settings, &dir, port)?;
            let locks_dir = dir.locks_path();
            let root = dir.root_path().to_owned();
            let log_path = dir.log_path();
            let mut running = RunningServer {
                handle: ServerHandle {
                    data_dir: dir.data_path(),
                    host: settings.host.clone(),
                    port,
                    process,
                },
                dir: Some(dir),
                shutdown_timeout: settings.shutdown_timeout,
                released: false,
            };

            wait_until_ready(&settings, &mut running.handle, log_path.as_std_path())?;

            let connection =
                ConnectionSettings::new(settings.host.clone(), port, settings.superuser.clone());
            let admin = admin::build_admin(
                settings.admin,
                &connection,
                toolchain,
                settings.command_timeout,
            );
            admin
                .create_database(&settings.template)
                .map_err(|err| ProvisionError::new(ProvisionStep::Template, err.into_report()))?;
            info!(
                target: LOG_TARGET,
                port,
                pid = running.handle.pid(),
                template = %settings.template,
                "ephemeral server ready"
            );
            (running, connection, admin, locks_dir, root)
        };

        Ok(Self {
            settings,
            connection,
            admin,
            locks_dir,
            root,
            running: Some(running),
            _server_span: span,
        })
    }

    /// Returns the connection settings for the running server.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionSettings {
        &self.connection
    }

    /// Returns the settings the server was started with.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Returns the template database name.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.settings.template
    }

    /// Returns the admin used to create the template; clone pools share it.
    #[must_use]
    pub fn admin(&self) -> Arc<dyn DatabaseAdmin> {
        Arc::clone(&self.admin)
    }

    /// Returns the directory holding per-fingerprint clone locks.
    #[must_use]
    pub fn locks_dir(&self) -> &Utf8Path {
        &self.locks_dir
    }

    /// Returns the temporary root that holds all server state.
    #[must_use]
    pub fn root_dir(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the process handle while the server runs.
    #[must_use]
    pub fn handle(&self) -> Option<&ServerHandle> {
        self.running.as_ref().map(|running| &running.handle)
    }

    /// Returns `true` until [`stop`](Self::stop) has run.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stops the server and removes its directory. Idempotent; removal
    /// failures are logged, never returned.
    pub fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.release();
        }
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_initdb(toolchain: &Toolchain, settings: &ServerSettings, dir: &ServerDataDir) -> Result<()> {
    let mut command = toolchain.command("initdb");
    command
        .arg("-D")
        .arg(dir.data_path().as_std_path())
        .arg("-U")
        .arg(&settings.superuser)
        .arg("--auth=trust");
    run_utility(&mut command, "initdb", settings.command_timeout)
        .map_err(|report| ProvisionError::new(ProvisionStep::Init, report))?;
    Ok(())
}

fn launch_postgres(
    toolchain: &Toolchain,
    settings: &ServerSettings,
    dir: &ServerDataDir,
    port: u16,
) -> Result<Child> {
    let spawn = || -> color_eyre::Result<Child> {
        let log = File::create(dir.log_path()).context("failed to create server log")?;
        let log_err = log.try_clone().context("failed to duplicate server log handle")?;
        let mut command: Command = toolchain.command("postgres");
        command
            .arg("-D")
            .arg(dir.data_path().as_std_path())
            .arg("-h")
            .arg(&settings.host)
            .arg("-p")
            .arg(port.to_string())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        command.spawn().context("failed to spawn postgres")
    };
    let child = spawn().map_err(|report| ProvisionError::new(ProvisionStep::Start, report))?;
    info!(target: LOG_TARGET, port, pid = child.id(), "launched postgres");
    Ok(child)
}

fn wait_until_ready(
    settings: &ServerSettings,
    handle: &mut ServerHandle,
    log_path: &std::path::Path,
) -> Result<()> {
    let host = handle.host.clone();
    let port = handle.port;
    let waiter = ReadinessWaiter::new(settings.ready_timeout);
    match waiter.wait_while(&host, port, || handle.is_running()) {
        Ok(()) => Ok(()),
        Err(ReadinessFailure::TimedOut(err)) => {
            warn!(
                target: LOG_TARGET,
                port,
                log = %log_tail(log_path),
                "server did not become ready"
            );
            Err(err.into())
        }
        Err(ReadinessFailure::ProcessExited) => Err(ProvisionError::new(
            ProvisionStep::Start,
            eyre!(
                "postgres exited before accepting connections on {host}:{port}\nlog: {}",
                log_tail(log_path)
            ),
        )
        .into()),
    }
}
