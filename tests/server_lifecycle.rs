//! Drives `EphemeralServer` through start-up failures with fake binaries and,
//! when `PostgreSQL` is installed, through a real start and stop.
#![cfg(unix)]

use std::net::TcpStream;
use std::time::{Duration, Instant};

use color_eyre::eyre::{Result, bail, ensure};
use pg_ephemeral_clones::test_support::postgres_unavailable_reason;
use pg_ephemeral_clones::{
    EphemeralServer, Error, PgEphemeralCfg, ProvisionStep, ServerSettings,
};
use rstest::rstest;
use serial_test::serial;

#[path = "support/fake_postgres.rs"]
mod fake_postgres;

use fake_postgres::{FakeToolchain, server_dirs_in};

/// Starts a server with `TMPDIR` pointed at a fresh directory and returns the
/// outcome together with the number of server directories left behind.
fn start_isolated(settings: ServerSettings) -> Result<(pg_ephemeral_clones::Result<EphemeralServer>, usize)> {
    let tmp = tempfile::tempdir()?;
    let tmp_path = tmp.path().to_path_buf();
    temp_env::with_var("TMPDIR", Some(tmp_path.as_os_str()), || {
        let outcome = EphemeralServer::start(settings);
        let leftovers = server_dirs_in(&tmp_path)?;
        Ok((outcome, leftovers))
    })
}

fn fake_settings(toolchain: &FakeToolchain) -> Result<ServerSettings> {
    Ok(ServerSettings {
        bin_dir: Some(toolchain.bin_dir()?),
        host: "127.0.0.1".into(),
        ready_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(10),
        ..ServerSettings::default()
    })
}

fn provision_step(outcome: pg_ephemeral_clones::Result<EphemeralServer>) -> Result<(ProvisionStep, String)> {
    match outcome {
        Err(Error::Provision(err)) => {
            let message = err.to_string();
            Ok((err.step(), message))
        }
        Err(other) => bail!("expected a provisioning error, got {other:?}"),
        Ok(_) => bail!("start should have failed"),
    }
}

#[rstest]
#[serial]
fn failing_initdb_is_an_init_error_and_cleans_up() -> Result<()> {
    let toolchain = FakeToolchain::new()?;
    toolchain.script("initdb", "echo 'initdb: cannot be run as root' >&2\nexit 1")?;

    let (outcome, leftovers) = start_isolated(fake_settings(&toolchain)?)?;
    let (step, message) = provision_step(outcome)?;

    ensure!(step == ProvisionStep::Init);
    ensure!(message.contains("initdb"), "message: {message}");
    ensure!(leftovers == 0, "server directory must be removed");
    Ok(())
}

#[rstest]
#[serial]
fn missing_binaries_fail_at_init() -> Result<()> {
    let toolchain = FakeToolchain::new()?;
    let (outcome, leftovers) = start_isolated(fake_settings(&toolchain)?)?;
    let (step, _) = provision_step(outcome)?;
    ensure!(step == ProvisionStep::Init);
    ensure!(leftovers == 0);
    Ok(())
}

#[rstest]
#[serial]
fn postgres_exiting_early_fails_fast_with_its_log() -> Result<()> {
    let toolchain = FakeToolchain::new()?;
    toolchain.working_initdb()?;
    toolchain.script(
        "postgres",
        "echo 'FATAL:  could not bind IPv4 address: Address already in use' >&2\nexit 1",
    )?;
    let settings = ServerSettings {
        ready_timeout: Duration::from_secs(30),
        ..fake_settings(&toolchain)?
    };

    let started = Instant::now();
    let (outcome, leftovers) = start_isolated(settings)?;
    let (step, message) = provision_step(outcome)?;

    ensure!(step == ProvisionStep::Start);
    ensure!(message.contains("Address already in use"), "message: {message}");
    ensure!(
        started.elapsed() < Duration::from_secs(15),
        "a dead server must not consume the readiness budget"
    );
    ensure!(leftovers == 0);
    Ok(())
}

#[rstest]
#[serial]
fn unreachable_server_times_out_and_is_stopped() -> Result<()> {
    let toolchain = FakeToolchain::new()?;
    toolchain.working_initdb()?;
    toolchain.script("postgres", "exec sleep 60")?;

    let started = Instant::now();
    let (outcome, leftovers) = start_isolated(fake_settings(&toolchain)?)?;

    match outcome {
        Err(Error::Timeout(err)) => ensure!(err.waited() >= Duration::from_secs(2)),
        Err(other) => bail!("expected a timeout, got {other:?}"),
        Ok(_) => bail!("start should have timed out"),
    }
    ensure!(started.elapsed() < Duration::from_secs(20));
    ensure!(leftovers == 0, "server directory must be removed after a timeout");
    Ok(())
}

#[rstest]
#[serial]
fn real_server_starts_listens_and_stops() -> Result<()> {
    if let Some(reason) = postgres_unavailable_reason() {
        tracing::warn!("{reason}");
        return Ok(());
    }

    let settings = PgEphemeralCfg::load()?.to_settings()?.server;
    let mut server = EphemeralServer::start(settings)?;
    let connection = server.connection().clone();
    ensure!(
        TcpStream::connect((connection.host(), connection.port())).is_ok(),
        "server must accept connections as soon as start returns"
    );
    ensure!(server.admin().database_exists(server.template())?);
    let root = server.root_dir().to_owned();
    let pid = server.handle().map(pg_ephemeral_clones::ServerHandle::pid);

    server.stop();
    server.stop();

    ensure!(!server.is_running());
    ensure!(!root.exists(), "temporary directory must be removed");
    if let Some(pid) = pid {
        let alive = std::path::Path::new(&format!("/proc/{pid}")).exists();
        ensure!(!alive, "postmaster {pid} must be gone");
    }
    Ok(())
}
