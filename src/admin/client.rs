//! [`DatabaseAdmin`] that talks SQL to the server through the `postgres`
//! client.

use color_eyre::eyre::WrapErr;
use postgres::{Client, NoTls};
use tracing::info_span;

use super::{DatabaseAdmin, escape_identifier};
use crate::error::{CloneError, CloneErrorKind, CloneResult};
use crate::observability::LOG_TARGET;
use crate::server::ConnectionSettings;

/// Issues `CREATE DATABASE`/`DROP DATABASE` over a fresh superuser
/// connection to the `postgres` database for every call.
///
/// # Examples
/// ```no_run
/// use pg_ephemeral_clones::{ClientAdmin, ConnectionSettings, DatabaseAdmin};
///
/// # fn main() -> pg_ephemeral_clones::CloneResult<()> {
/// let admin = ClientAdmin::new(ConnectionSettings::new("localhost", 54_321, "postgres"));
/// assert!(admin.database_exists("postgres")?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAdmin {
    connection: ConnectionSettings,
}

impl ClientAdmin {
    /// Creates an admin for the given server.
    #[must_use]
    pub const fn new(connection: ConnectionSettings) -> Self {
        Self { connection }
    }

    fn admin_client(&self, kind: CloneErrorKind) -> CloneResult<Client> {
        Client::connect(&self.connection.conninfo("postgres"), NoTls)
            .wrap_err("failed to connect to admin database")
            .map_err(|report| CloneError::new(kind, report))
    }

    fn execute(&self, sql: &str, context: String, kind: CloneErrorKind) -> CloneResult<()> {
        let mut client = self.admin_client(kind)?;
        client
            .batch_execute(sql)
            .wrap_err(context)
            .map_err(|report| CloneError::new(kind, report))
    }
}

impl DatabaseAdmin for ClientAdmin {
    fn create_database(&self, name: &str) -> CloneResult<()> {
        let _span = info_span!(target: LOG_TARGET, "create_database", db = %name).entered();
        let escaped = escape_identifier(name);
        self.execute(
            &format!("CREATE DATABASE \"{escaped}\""),
            format!("failed to create database '{name}'"),
            CloneErrorKind::Create,
        )
    }

    fn clone_database(&self, name: &str, template: &str) -> CloneResult<()> {
        let _span = info_span!(
            target: LOG_TARGET,
            "clone_database",
            db = %name,
            template = %template
        )
        .entered();
        let escaped_name = escape_identifier(name);
        let escaped_template = escape_identifier(template);
        self.execute(
            &format!("CREATE DATABASE \"{escaped_name}\" TEMPLATE \"{escaped_template}\""),
            format!("failed to create database '{name}' from template '{template}'"),
            CloneErrorKind::Create,
        )
    }

    fn drop_database(&self, name: &str) -> CloneResult<()> {
        let _span = info_span!(target: LOG_TARGET, "drop_database", db = %name).entered();
        let escaped = escape_identifier(name);
        self.execute(
            &format!("DROP DATABASE \"{escaped}\""),
            format!("failed to drop database '{name}'"),
            CloneErrorKind::Drop,
        )
    }

    fn database_exists(&self, name: &str) -> CloneResult<bool> {
        let mut client = self.admin_client(CloneErrorKind::Lookup)?;
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&name],
            )
            .wrap_err("failed to query pg_database")
            .map_err(|report| CloneError::new(CloneErrorKind::Lookup, report))?;
        Ok(row.get(0))
    }
}
