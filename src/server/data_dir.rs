//! Private on-disk layout for one ephemeral server.
//!
//! ```text
//! test-XXXXXX-pg-ephemeral/
//! ├── data/            cluster created by initdb
//! ├── locks/           per-fingerprint clone locks
//! ├── postgres.log     server stdout and stderr
//! └── .s.PGSQL.<port>  unix socket
//! ```

use std::fs::OpenOptions;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Report;
use color_eyre::eyre::{Context, eyre};
use tempfile::{Builder, TempDir};

/// Settings appended to `postgresql.conf`. The data is disposable, so
/// durability is traded for startup and write speed.
pub(crate) const DURABILITY_OVERLAY: &[(&str, &str)] = &[
    ("fsync", "off"),
    ("full_page_writes", "off"),
    ("synchronous_commit", "off"),
];

#[derive(Debug)]
pub(crate) struct ServerDataDir {
    dir: TempDir,
    root: Utf8PathBuf,
}

impl ServerDataDir {
    pub(crate) fn create() -> Result<Self, Report> {
        let dir = Builder::new()
            .prefix("test-")
            .suffix("-pg-ephemeral")
            .tempdir()
            .context("failed to create temporary directory for the server")?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|path| eyre!("temporary directory {} is not UTF-8", path.display()))?;
        let ret = Self { dir, root };
        std::fs::create_dir(ret.locks_path()).context("failed to create locks directory")?;
        Ok(ret)
    }

    pub(crate) fn root_path(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn data_path(&self) -> Utf8PathBuf {
        self.root.join("data")
    }

    pub(crate) fn locks_path(&self) -> Utf8PathBuf {
        self.root.join("locks")
    }

    pub(crate) fn log_path(&self) -> Utf8PathBuf {
        self.root.join("postgres.log")
    }

    pub(crate) fn config_path(&self) -> Utf8PathBuf {
        self.data_path().join("postgresql.conf")
    }

    /// Appends the durability overlay and the socket directory to the
    /// configuration written by `initdb`. Later entries win.
    pub(crate) fn write_overlay(&self) -> Result<(), Report> {
        let path = self.config_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open {path}"))?;
        let mut overlay = String::from("\n# pg-ephemeral-clones overlay\n");
        for (key, value) in DURABILITY_OVERLAY {
            overlay.push_str(&format!("{key} = {value}\n"));
        }
        let socket_dir = self.root.as_str().replace('\'', "''");
        overlay.push_str(&format!("unix_socket_directories = '{socket_dir}'\n"));
        file.write_all(overlay.as_bytes())
            .wrap_err_with(|| format!("failed to write {path}"))?;
        Ok(())
    }

    /// Removes the directory tree, reporting failures to the caller.
    pub(crate) fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}
