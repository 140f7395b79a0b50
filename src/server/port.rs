//! Free-port discovery for the ephemeral server.

use std::net::TcpListener;

use crate::error::ResourceError;
use crate::observability::LOG_TARGET;

/// Asks the OS for an unused TCP port on `host`.
///
/// Binds a transient listener to port 0, reads back the assigned port and
/// releases the socket before returning. The port is free at the moment of
/// return; nothing reserves it for the caller.
///
/// # Errors
/// Returns a [`ResourceError`] when `host` cannot be resolved or bound.
///
/// # Examples
/// ```
/// use pg_ephemeral_clones::allocate_port;
///
/// let port = allocate_port("127.0.0.1")?;
/// assert_ne!(port, 0);
/// # Ok::<(), pg_ephemeral_clones::ResourceError>(())
/// ```
pub fn allocate_port(host: &str) -> Result<u16, ResourceError> {
    let listener = TcpListener::bind((host, 0)).map_err(|err| ResourceError::new(host, err))?;
    let port = listener
        .local_addr()
        .map_err(|err| ResourceError::new(host, err))?
        .port();
    drop(listener);
    tracing::debug!(target: LOG_TARGET, host, port, "allocated server port");
    Ok(port)
}
