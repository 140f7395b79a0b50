//! Skip heuristics for suites that need real `PostgreSQL` binaries.
//!
//! Tests that cannot run on the current host panic or return early with a
//! message carrying [`SKIP_TEST_CLUSTER_PREFIX`], so CI logs make the skip
//! obvious without failing the build.

use std::env;
use std::path::{Path, PathBuf};

/// Prefix used by panic and log messages that tests convert into skips.
pub const SKIP_TEST_CLUSTER_PREFIX: &str = "SKIP-TEST-CLUSTER";

const BIN_DIR_VAR: &str = "PG_EPHEMERAL_BIN_DIR";
const REQUIRED_BINARIES: &[&str] = &["initdb", "postgres", "createdb", "dropdb", "psql"];

/// Returns why a real server cannot be started here, or `None` when it can.
///
/// `initdb` refuses to run as root, and every utility must be present either
/// in `PG_EPHEMERAL_BIN_DIR` or on `PATH`.
#[must_use]
pub fn postgres_unavailable_reason() -> Option<String> {
    if nix::unistd::geteuid().is_root() {
        return Some(format_skip_reason("initdb cannot run as root"));
    }
    let bin_dir = env::var_os(BIN_DIR_VAR).map(PathBuf::from);
    REQUIRED_BINARIES
        .iter()
        .find(|binary| !binary_available(binary, bin_dir.as_deref()))
        .map(|missing| {
            format_skip_reason(format!("PostgreSQL binary '{missing}' was not found"))
        })
}

/// Returns `true` when [`postgres_unavailable_reason`] finds nothing wrong.
#[must_use]
pub fn postgres_binaries_available() -> bool {
    postgres_unavailable_reason().is_none()
}

/// Prefixes `reason` with the shared skip marker.
#[must_use]
pub fn format_skip_reason(reason: impl AsRef<str>) -> String {
    format!("{SKIP_TEST_CLUSTER_PREFIX}: {}", reason.as_ref())
}

fn binary_available(name: &str, bin_dir: Option<&Path>) -> bool {
    match bin_dir {
        Some(dir) => dir.join(name).is_file(),
        None => env::var_os("PATH")
            .is_some_and(|path| env::split_paths(&path).any(|dir| dir.join(name).is_file())),
    }
}
