//! Cross-process file locking for clone creation and removal.
//!
//! Worker processes racing on the same fingerprint against a shared server
//! serialise through an exclusive `flock(2)` on `<locks>/<fingerprint>.lock`.
//! On non-Unix platforms locking is a no-op.

use camino::Utf8Path;
use std::fs::{File, OpenOptions};
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::Fingerprint;

/// Guard that holds an exclusive file lock until dropped.
#[derive(Debug)]
pub(crate) struct CloneFileLock {
    _file: File,
}

impl CloneFileLock {
    /// Blocks until the exclusive lock for `fingerprint` is held.
    #[cfg(unix)]
    pub(crate) fn acquire(locks_dir: &Utf8Path, fingerprint: &Fingerprint) -> io::Result<Self> {
        std::fs::create_dir_all(locks_dir)?;

        let lock_path = locks_dir.join(format!("{fingerprint}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        // SAFETY: The file descriptor obtained from `file.as_raw_fd()` is valid
        // because `file` was opened above and remains owned by this scope
        // until after the `flock` call completes.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { _file: file })
    }

    /// No-op lock acquisition on non-Unix platforms.
    #[cfg(not(unix))]
    pub(crate) fn acquire(locks_dir: &Utf8Path, fingerprint: &Fingerprint) -> io::Result<Self> {
        std::fs::create_dir_all(locks_dir)?;
        let lock_path = locks_dir.join(format!("{fingerprint}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok(Self { _file: file })
    }
}
