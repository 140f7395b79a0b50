//! Connection parameters shared by every consumer of the ephemeral server.
use serde::{Deserialize, Serialize};

/// Immutable `{host, port, user}` triple describing the running server.
///
/// # Examples
/// ```
/// use pg_ephemeral_clones::ConnectionSettings;
///
/// let settings = ConnectionSettings::new("localhost", 54_321, "postgres");
/// assert_eq!(
///     settings.database_url("orders"),
///     "postgresql://postgres@localhost:54321/orders"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionSettings {
    host: String,
    port: u16,
    user: String,
}

impl ConnectionSettings {
    /// Constructs connection settings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Returns the server host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the server port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the superuser name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Builds a libpq-compatible URL for `database`.
    #[must_use]
    pub fn database_url(&self, database: &str) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!(
            "postgresql://{user}@{host}:{port}/{database}",
            user = self.user,
            port = self.port
        )
    }

    /// Builds a key/value connection string for `database`.
    #[must_use]
    pub fn conninfo(&self, database: &str) -> String {
        format!(
            "host={host} port={port} user={user} dbname={database} connect_timeout=10",
            host = quote_conninfo(&self.host),
            port = self.port,
            user = quote_conninfo(&self.user),
            database = quote_conninfo(database),
        )
    }
}

fn quote_conninfo(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
