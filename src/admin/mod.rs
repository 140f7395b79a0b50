//! Database administration against the ephemeral server.
//!
//! [`DatabaseAdmin`] is the seam through which the supervisor creates the
//! template and the clone pool creates, probes and drops clones. Two
//! implementations ship: [`CommandLineAdmin`] drives `createdb`, `dropdb` and
//! `psql`; [`ClientAdmin`] issues SQL through the `postgres` client.

mod client;
mod command_line;

pub use self::client::ClientAdmin;
pub use self::command_line::CommandLineAdmin;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::eyre;

use crate::error::{CloneResult, ConfigError};
use crate::server::{ConnectionSettings, Toolchain};

/// Creates, clones, probes and drops databases on a running server.
#[cfg_attr(test, mockall::automock)]
pub trait DatabaseAdmin: Send + Sync {
    /// Creates an empty database called `name`.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) of kind `Create` when the
    /// server rejects the request.
    fn create_database(&self, name: &str) -> CloneResult<()>;

    /// Creates `name` as a copy of `template` using the server's native
    /// template copy.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) of kind `Create` when the
    /// target exists, the template is missing or busy, or the server is
    /// unreachable.
    fn clone_database(&self, name: &str, template: &str) -> CloneResult<()>;

    /// Drops `name`.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) of kind `Drop`, for
    /// instance while another connection is still open against it.
    fn drop_database(&self, name: &str) -> CloneResult<()>;

    /// Reports whether a database called `name` exists.
    ///
    /// # Errors
    /// Returns a [`CloneError`](crate::CloneError) of kind `Lookup` when the
    /// catalogue cannot be queried.
    fn database_exists(&self, name: &str) -> CloneResult<bool>;
}

/// Selects the [`DatabaseAdmin`] implementation a server uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdminKind {
    /// `createdb`/`dropdb`/`psql` client utilities.
    #[default]
    CommandLine,
    /// SQL over the `postgres` client crate.
    Client,
}

impl FromStr for AdminKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cli" | "command-line" | "command_line" => Ok(Self::CommandLine),
            "client" | "sql" => Ok(Self::Client),
            other => Err(ConfigError::from(eyre!(
                "unknown admin implementation '{other}'; expected 'cli' or 'client'"
            ))),
        }
    }
}

pub(crate) fn build_admin(
    kind: AdminKind,
    connection: &ConnectionSettings,
    toolchain: Toolchain,
    timeout: Duration,
) -> Arc<dyn DatabaseAdmin> {
    match kind {
        AdminKind::CommandLine => Arc::new(CommandLineAdmin::with_toolchain(
            connection.clone(),
            toolchain,
            timeout,
        )),
        AdminKind::Client => Arc::new(ClientAdmin::new(connection.clone())),
    }
}

/// Escapes double quotes so `name` can be embedded in a quoted identifier.
pub(crate) fn escape_identifier(name: &str) -> String {
    name.replace('"', "\"\"")
}

/// Escapes single quotes so `value` can be embedded in a string literal.
pub(crate) fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}
