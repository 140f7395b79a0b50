//! Stable fingerprints for per-test identities.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Number of digest bytes kept; 16 bytes render as 32 hex characters, well
/// inside `PostgreSQL`'s 63-byte identifier limit.
const FINGERPRINT_BYTES: usize = 16;

/// Deterministic, content-based digest of a test identity.
///
/// The fingerprint doubles as the clone's database name, so repeated runs
/// against the same identity map to the same database.
///
/// # Examples
/// ```
/// use pg_ephemeral_clones::Fingerprint;
///
/// let first = Fingerprint::of("/tmp/test-a");
/// assert_eq!(first, Fingerprint::of("/tmp/test-a"));
/// assert_ne!(first, Fingerprint::of("/tmp/test-b"));
/// assert_eq!(first.as_str().len(), 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints arbitrary identity bytes.
    #[must_use]
    pub fn of(identity: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(identity.as_ref());
        Self(
            digest
                .iter()
                .take(FINGERPRINT_BYTES)
                .map(|byte| format!("{byte:02x}"))
                .collect(),
        )
    }

    /// Fingerprints a filesystem path, typically the test's isolated working
    /// directory.
    #[must_use]
    pub fn of_path(path: &Path) -> Self {
        Self::of(path.as_os_str().as_encoded_bytes())
    }

    /// Returns the lowercase hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the database name derived from this fingerprint.
    #[must_use]
    pub fn database_name(&self) -> DatabaseName {
        DatabaseName(self.0.clone())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a database created inside the ephemeral server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Wraps an existing database name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DatabaseName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for DatabaseName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DatabaseName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
