//! Graceful termination of the server process.

use std::io::ErrorKind;
use std::process::{Child, ExitStatus};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};
use wait_timeout::ChildExt;

use crate::observability::LOG_TARGET;

/// Sends `SIGTERM` and blocks until the process exits, escalating to
/// `SIGKILL` once `timeout` elapses.
pub(crate) fn terminate(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    send_sigterm(child);

    if let Some(status) = child.wait_timeout(timeout)? {
        info!(target: LOG_TARGET, pid = child.id(), %status, "server exited after SIGTERM");
        return Ok(status);
    }

    warn!(
        target: LOG_TARGET,
        pid = child.id(),
        timeout_secs = timeout.as_secs(),
        "server ignored SIGTERM; sending SIGKILL"
    );
    match child.kill() {
        Ok(()) => {}
        // `InvalidInput` indicates the child has already exited.
        Err(err) if err.kind() == ErrorKind::InvalidInput => {}
        Err(err) => return Err(err),
    }
    child.wait()
}

fn send_sigterm(child: &Child) {
    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // `ESRCH` means the process is already gone.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(target: LOG_TARGET, pid = raw, error = %err, "failed to send SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn sigterm_stops_a_cooperative_process() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let status = terminate(&mut child, Duration::from_secs(5)).expect("terminate");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn stubborn_process_is_killed_after_timeout() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .expect("spawn stubborn shell");
        // Give the shell a moment to install its trap.
        std::thread::sleep(Duration::from_millis(100));
        let status = terminate(&mut child, Duration::from_millis(200)).expect("terminate");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn already_exited_process_reports_its_status() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let exited = child
            .wait_timeout(Duration::from_secs(5))
            .expect("wait for true");
        assert!(exited.is_some(), "true should exit promptly");
        let status = terminate(&mut child, Duration::from_secs(1)).expect("terminate");
        assert!(status.success());
    }
}
