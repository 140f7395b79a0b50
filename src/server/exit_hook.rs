//! Process-exit hook that stops a leaked server on `atexit`.
//!
//! The shared test session is leaked so it lives for the whole test binary,
//! which means `Drop` never runs. [`register_exit_hook`] stores the server's
//! PID and temporary root in a [`OnceLock`] and registers an `extern "C"`
//! callback with [`libc::atexit`]. At exit the callback sends `SIGTERM`,
//! reaps the child, escalates to `SIGKILL` on timeout, and removes the
//! temporary directory.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use color_eyre::eyre::eyre;

/// State captured at registration time and read by the atexit callback.
struct ExitState {
    pid: libc::pid_t,
    root: PathBuf,
    shutdown_timeout: Duration,
}

static EXIT_STATE: OnceLock<ExitState> = OnceLock::new();

/// Polling interval when waiting for the server to exit after `SIGTERM`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Registers the exit hook. Only the first registration in a process takes
/// effect; later calls are no-ops.
pub(crate) fn register_exit_hook(
    pid: u32,
    root: PathBuf,
    shutdown_timeout: Duration,
) -> color_eyre::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|err| eyre!("pid out of range: {err}"))?;
    if EXIT_STATE
        .set(ExitState {
            pid,
            root,
            shutdown_timeout,
        })
        .is_err()
    {
        tracing::debug!(
            target: crate::observability::LOG_TARGET,
            "exit hook already registered; skipping duplicate registration"
        );
        return Ok(());
    }
    // SAFETY: `exit_callback` is an `extern "C"` function with no parameters
    // and no return value, matching the signature required by `atexit(3)`.
    // It only reads `EXIT_STATE`, which lives for the rest of the process.
    let rc = unsafe { libc::atexit(exit_callback) };
    if rc != 0 {
        return Err(eyre!("libc::atexit registration failed (rc={rc})"));
    }
    tracing::debug!(
        target: crate::observability::LOG_TARGET,
        pid,
        "registered atexit hook for the ephemeral server"
    );
    Ok(())
}

extern "C" fn exit_callback() {
    let Some(state) = EXIT_STATE.get() else {
        return;
    };
    stop_server(state.pid, state.shutdown_timeout);
    drop(std::fs::remove_dir_all(&state.root));
}

fn stop_server(pid: libc::pid_t, timeout: Duration) {
    if reap(pid) {
        return;
    }
    // SAFETY: `pid` names a child this process spawned and has not reaped.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if reap(pid) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    // SAFETY: As above; SIGKILL cannot be ignored.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    let mut status = 0;
    // SAFETY: Blocking reap of our own child; `status` is a valid out-pointer.
    unsafe {
        libc::waitpid(pid, &raw mut status, 0);
    }
}

/// Returns `true` once the child has exited (or is no longer ours to reap).
fn reap(pid: libc::pid_t) -> bool {
    let mut status = 0;
    // SAFETY: Non-blocking reap of our own child; `status` is a valid
    // out-pointer.
    let rc = unsafe { libc::waitpid(pid, &raw mut status, libc::WNOHANG) };
    rc != 0
}
