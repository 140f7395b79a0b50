//! [`DatabaseAdmin`] backed by the `createdb`, `dropdb` and `psql` utilities.

use std::process::Command;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::info_span;

use super::{DatabaseAdmin, escape_literal};
use crate::error::{CloneError, CloneErrorKind, CloneResult};
use crate::observability::LOG_TARGET;
use crate::server::{ConnectionSettings, Toolchain, run_utility};

/// Drives the server through its client utilities.
///
/// # Examples
/// ```no_run
/// use std::time::Duration;
///
/// use pg_ephemeral_clones::{CommandLineAdmin, ConnectionSettings, DatabaseAdmin};
///
/// # fn main() -> pg_ephemeral_clones::CloneResult<()> {
/// let connection = ConnectionSettings::new("localhost", 54_321, "postgres");
/// let admin = CommandLineAdmin::new(connection, None, Duration::from_secs(30));
/// admin.clone_database("scratch", "template_clone_source")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandLineAdmin {
    connection: ConnectionSettings,
    toolchain: Toolchain,
    timeout: Duration,
}

impl CommandLineAdmin {
    /// Creates an admin that looks up utilities in `bin_dir`, or on `PATH`
    /// when `None`.
    #[must_use]
    pub const fn new(
        connection: ConnectionSettings,
        bin_dir: Option<Utf8PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self::with_toolchain(connection, Toolchain::new(bin_dir), timeout)
    }

    pub(crate) const fn with_toolchain(
        connection: ConnectionSettings,
        toolchain: Toolchain,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            toolchain,
            timeout,
        }
    }

    fn utility(&self, program: &str) -> Command {
        let mut command = self.toolchain.command(program);
        command
            .arg("-h")
            .arg(self.connection.host())
            .arg("-p")
            .arg(self.connection.port().to_string())
            .arg("-U")
            .arg(self.connection.user());
        command
    }

    fn run(&self, mut command: Command, context: &str, kind: CloneErrorKind) -> CloneResult<String> {
        let output = run_utility(&mut command, context, self.timeout)
            .map_err(|report| CloneError::new(kind, report))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DatabaseAdmin for CommandLineAdmin {
    fn create_database(&self, name: &str) -> CloneResult<()> {
        let _span = info_span!(target: LOG_TARGET, "create_database", db = %name).entered();
        let mut command = self.utility("createdb");
        command.arg("--").arg(name);
        self.run(command, "createdb", CloneErrorKind::Create)?;
        Ok(())
    }

    fn clone_database(&self, name: &str, template: &str) -> CloneResult<()> {
        let _span = info_span!(
            target: LOG_TARGET,
            "clone_database",
            db = %name,
            template = %template
        )
        .entered();
        let mut command = self.utility("createdb");
        command.arg("-T").arg(template).arg("--").arg(name);
        self.run(command, "createdb", CloneErrorKind::Create)?;
        Ok(())
    }

    fn drop_database(&self, name: &str) -> CloneResult<()> {
        let _span = info_span!(target: LOG_TARGET, "drop_database", db = %name).entered();
        let mut command = self.utility("dropdb");
        command.arg("--").arg(name);
        self.run(command, "dropdb", CloneErrorKind::Drop)?;
        Ok(())
    }

    fn database_exists(&self, name: &str) -> CloneResult<bool> {
        let mut command = self.utility("psql");
        command
            .args(["-d", "postgres", "-X", "-t", "-A", "-c"])
            .arg(format!(
                "SELECT 1 FROM pg_database WHERE datname = '{}'",
                escape_literal(name)
            ));
        let stdout = self.run(command, "psql", CloneErrorKind::Lookup)?;
        Ok(stdout.trim() == "1")
    }
}
