//! Domain error types for the ephemeral `PostgreSQL` harness.
//!
//! Anything that prevents the shared server from existing is fatal to the
//! session ([`ResourceError`], [`ProvisionError`], [`TimeoutError`]). Failures
//! scoped to one test's clone surface as [`CloneError`] and stay with that
//! test.

use std::time::Duration;

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return a [`PgEphemeralError`].
pub type Result<T> = std::result::Result<T, PgEphemeralError>;

/// Result alias for clone-scoped fallible operations.
pub type CloneResult<T> = std::result::Result<T, CloneError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum PgEphemeralError {
    /// No port could be allocated for the server.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// A provisioning step failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// The server never became reachable.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// A single clone operation failed.
    #[error(transparent)]
    Clone(#[from] CloneError),
    /// Configuration parsing or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Raised when no TCP port can be bound on the requested host.
#[derive(Debug, Error)]
#[error("failed to allocate a port on {host}")]
pub struct ResourceError {
    host: String,
    #[source]
    source: std::io::Error,
}

impl ResourceError {
    /// Constructs a resource error for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            host: host.into(),
            source,
        }
    }

    /// Returns the host that could not be bound.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Names the provisioning step that failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProvisionStep {
    /// Creating the temporary directory or running `initdb`.
    Init,
    /// Writing the configuration overlay.
    Configure,
    /// Launching the `postgres` process.
    Start,
    /// Creating the template database.
    Template,
}

impl ProvisionStep {
    /// Returns a short lowercase label for the step.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Template => "template",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captures a fatal failure while bringing the server up.
#[derive(Debug, Error)]
#[error("provisioning step '{step}' failed: {report}")]
pub struct ProvisionError {
    step: ProvisionStep,
    #[source]
    report: Report,
}

impl ProvisionError {
    /// Constructs a provisioning error for `step`.
    #[must_use]
    pub const fn new(step: ProvisionStep, report: Report) -> Self {
        Self { step, report }
    }

    /// Returns the step that failed.
    #[must_use]
    pub const fn step(&self) -> ProvisionStep {
        self.step
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

/// Raised when the server does not accept connections within its budget.
#[derive(Debug, Error)]
#[error("server at {host}:{port} was not ready after {}s", waited.as_secs())]
pub struct TimeoutError {
    host: String,
    port: u16,
    waited: Duration,
}

impl TimeoutError {
    /// Constructs a timeout error for the given endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, waited: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            waited,
        }
    }

    /// Returns the port that never became reachable.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns how long the waiter polled before giving up.
    #[must_use]
    pub const fn waited(&self) -> Duration {
        self.waited
    }
}

/// Categorises clone failures so callers can branch on structured errors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum CloneErrorKind {
    /// Represents errors without a more specific semantic meaning.
    #[default]
    Other,
    /// Creating a database from the template failed.
    Create,
    /// Dropping a clone failed.
    Drop,
    /// Checking whether a database exists failed.
    Lookup,
    /// The per-fingerprint lock could not be acquired.
    Lock,
}

/// Captures a failure scoped to a single clone.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct CloneError {
    kind: CloneErrorKind,
    #[source]
    report: Report,
}

impl CloneError {
    /// Constructs a new clone error with the provided kind and diagnostic
    /// report.
    #[must_use]
    pub const fn new(kind: CloneErrorKind, report: Report) -> Self {
        Self { kind, report }
    }

    /// Returns the semantic category for this clone failure.
    #[must_use]
    pub const fn kind(&self) -> CloneErrorKind {
        self.kind
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<Report> for CloneError {
    fn from(report: Report) -> Self {
        Self::new(CloneErrorKind::Other, report)
    }
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);
