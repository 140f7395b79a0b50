//! Fake `PostgreSQL` utilities for exercising the supervisor's failure paths.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Result, eyre};
use tempfile::TempDir;

/// A directory of executable shell scripts standing in for the real binaries.
pub struct FakeToolchain {
    dir: TempDir,
}

impl FakeToolchain {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn bin_dir(&self) -> Result<Utf8PathBuf> {
        Utf8PathBuf::from_path_buf(self.dir.path().to_path_buf())
            .map_err(|path| eyre!("non UTF-8 path {}", path.display()))
    }

    /// Writes `name` as a `/bin/sh` script with `body`.
    pub fn script(&self, name: &str, body: &str) -> Result<()> {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        let mut permissions = fs::metadata(&path)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions)?;
        Ok(())
    }

    /// An `initdb` that creates the data directory named by `-D`.
    pub fn working_initdb(&self) -> Result<()> {
        self.script("initdb", "mkdir -p \"$2\" && touch \"$2/postgresql.conf\"")
    }
}

/// Counts leftover server directories in `dir`.
pub fn server_dirs_in(dir: &std::path::Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("test-") && name.ends_with("-pg-ephemeral") {
            count += 1;
        }
    }
    Ok(count)
}
