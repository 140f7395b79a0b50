//! Network readiness polling for a freshly launched server.
//!
//! Startup completion is only observable through the listener becoming
//! reachable, so the waiter blocks the calling thread and retries short TCP
//! connects until one succeeds or the budget runs out.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::TimeoutError;
use crate::observability::LOG_TARGET;

/// Delay between connection attempts.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single connection attempt.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a readiness wait ended without a connection.
#[derive(Debug)]
pub(crate) enum ReadinessFailure {
    /// The budget elapsed.
    TimedOut(TimeoutError),
    /// The liveness probe reported that the process has gone.
    ProcessExited,
}

/// Polls `host:port` until a TCP connection succeeds.
///
/// # Examples
/// ```
/// use std::net::TcpListener;
/// use std::time::Duration;
///
/// use pg_ephemeral_clones::ReadinessWaiter;
///
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let port = listener.local_addr()?.port();
/// ReadinessWaiter::new(Duration::from_secs(5)).wait("127.0.0.1", port)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    timeout: Duration,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl ReadinessWaiter {
    /// Creates a waiter with the given overall budget and one-second polling.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the delay between attempts.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the per-attempt connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the overall budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks until `host:port` accepts a connection.
    ///
    /// # Errors
    /// Returns a [`TimeoutError`] once the budget is exhausted.
    pub fn wait(&self, host: &str, port: u16) -> Result<(), TimeoutError> {
        match self.wait_while(host, port, || true) {
            Ok(()) => Ok(()),
            Err(ReadinessFailure::TimedOut(err)) => Err(err),
            Err(ReadinessFailure::ProcessExited) => {
                Err(TimeoutError::new(host, port, self.timeout))
            }
        }
    }

    /// Like [`wait`](Self::wait), but gives up early once `still_running`
    /// returns `false`.
    pub(crate) fn wait_while(
        &self,
        host: &str,
        port: u16,
        mut still_running: impl FnMut() -> bool,
    ) -> Result<(), ReadinessFailure> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            if self.try_connect(host, port) {
                tracing::debug!(
                    target: LOG_TARGET,
                    host,
                    port,
                    elapsed_ms = started.elapsed().as_millis(),
                    "server accepted a connection"
                );
                return Ok(());
            }
            if !still_running() {
                return Err(ReadinessFailure::ProcessExited);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReadinessFailure::TimedOut(TimeoutError::new(
                    host,
                    port,
                    started.elapsed(),
                )));
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn try_connect(&self, host: &str, port: u16) -> bool {
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr: SocketAddr| TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok())
    }
}

/// Blocks until `host:port` accepts a TCP connection or `timeout` elapses.
///
/// # Errors
/// Returns a [`TimeoutError`] once the budget is exhausted.
pub fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<(), TimeoutError> {
    ReadinessWaiter::new(timeout).wait(host, port)
}
