//! End-to-end checks against a real `PostgreSQL` installation. Every test
//! returns early with a `SKIP-TEST-CLUSTER` warning when the binaries are
//! missing or the suite runs as root.
#![cfg(unix)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};

use camino::Utf8PathBuf;
use color_eyre::eyre::{Result, ensure, eyre};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use pg_ephemeral_clones::test_support::{postgres_unavailable_reason, shared_session};
use pg_ephemeral_clones::{
    PgEphemeralCfg, PoolSettings, SessionSettings, StorageBackend, TestSession, with_session,
};
use postgres::{Client, NoTls};
use rstest::rstest;
use serial_test::serial;

fn skip() -> bool {
    postgres_unavailable_reason().is_some_and(|reason| {
        tracing::warn!("{reason}");
        true
    })
}

fn env_settings() -> Result<SessionSettings> {
    Ok(PgEphemeralCfg::load()?.to_settings()?)
}

fn settings_with_threshold(threshold: usize) -> Result<SessionSettings> {
    Ok(SessionSettings {
        pool: PoolSettings {
            cleanup_threshold: threshold,
        },
        ..env_settings()?
    })
}

#[rstest]
#[serial]
fn clones_are_real_databases_copied_from_the_template() -> Result<()> {
    if skip() {
        return Ok(());
    }
    with_session(env_settings()?, |session| -> Result<()> {
        let a = session.database_for("test-A")?;
        let again = session.database_for("test-A")?;
        let b = session.database_for("test-B")?;
        ensure!(a.name() == again.name());
        ensure!(a.name() != b.name());

        let mut client = Client::connect(&a.url(), NoTls)?;
        client.batch_execute("CREATE TABLE items (id integer PRIMARY KEY)")?;
        client.execute("INSERT INTO items VALUES (1)", &[])?;
        let count: i64 = client.query_one("SELECT count(*) FROM items", &[])?.get(0);
        ensure!(count == 1);
        drop(client);

        let admin = session.server().admin();
        ensure!(admin.database_exists(a.name().as_str())?);
        ensure!(admin.database_exists(b.name().as_str())?);
        Ok(())
    })?
}

#[rstest]
#[serial]
fn test_boundary_drops_clones_at_threshold() -> Result<()> {
    if skip() {
        return Ok(());
    }
    let mut session = TestSession::start(settings_with_threshold(2)?)?;
    let admin = session.server().admin();

    let first = session.database_for("test-1")?;
    let first_name = first.name().clone();
    drop(first);
    ensure!(admin.database_exists(first_name.as_str())?, "below threshold");

    let second = session.database_for("test-2")?;
    let report = second.finish();
    ensure!(report.dropped.len() == 2, "report: {report:?}");
    ensure!(!admin.database_exists(first_name.as_str())?);
    ensure!(session.pool().registry().is_empty());

    let root = session.server().root_dir().to_owned();
    session.stop();
    ensure!(!root.exists());
    Ok(())
}

#[rstest]
#[serial]
fn injected_storage_connects_to_its_clone() -> Result<()> {
    if skip() {
        return Ok(());
    }
    let session = TestSession::start(env_settings()?)?;
    let storage = session.injector().open(std::path::Path::new("/tmp/test-storage"));
    let database = storage.database()?;
    let connection = storage
        .connection()
        .ok_or_else(|| eyre!("cloned storage must expose a connection"))?;

    let mut client = Client::connect(&connection.database_url(database.as_str()), NoTls)?;
    let name: String = client.query_one("SELECT current_database()", &[])?.get(0);
    ensure!(name == database.as_str());
    Ok(())
}

#[rstest]
#[serial]
fn shared_session_is_started_once() -> Result<()> {
    if skip() {
        return Ok(());
    }
    let first = shared_session()?;
    let second = shared_session()?;
    ensure!(std::ptr::eq(first, second));
    ensure!(first.server().is_running());
    Ok(())
}

#[rstest]
#[serial]
fn with_session_stops_the_server_when_the_body_panics() -> Result<()> {
    if skip() {
        return Ok(());
    }
    let seen: Mutex<Option<(Utf8PathBuf, u32)>> = Mutex::new(None);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        with_session(env_settings().expect("settings"), |session| -> Result<()> {
            let server = session.server();
            *seen.lock().unwrap_or_else(PoisonError::into_inner) = server
                .handle()
                .map(|handle| (server.root_dir().to_owned(), handle.pid()));
            panic!("test body failed");
        })
    }));
    ensure!(outcome.is_err(), "the panic must propagate");

    let (root, pid) = seen
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .ok_or_else(|| eyre!("session body never ran"))?;
    ensure!(!root.exists(), "{root} must be removed");
    let raw = i32::try_from(pid)?;
    ensure!(kill(Pid::from_raw(raw), None).is_err(), "postmaster {pid} still running");
    Ok(())
}

#[rstest]
#[serial]
fn leased_clone_survives_another_tests_cleanup() -> Result<()> {
    if skip() {
        return Ok(());
    }
    let session = TestSession::start(settings_with_threshold(2)?)?;
    let finished = session.database_for("test-A")?;
    let running = session.database_for("test-B")?;

    let report = finished.finish();
    ensure!(report.leased == vec![running.name().clone()], "report: {report:?}");

    let mut client = Client::connect(&running.url(), NoTls)?;
    let name: String = client.query_one("SELECT current_database()", &[])?.get(0);
    ensure!(name == running.name().as_str());
    Ok(())
}
