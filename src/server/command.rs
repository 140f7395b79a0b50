//! Invocation of the `PostgreSQL` client and server utilities.
//!
//! Every utility runs with piped output under a timeout so a wedged binary
//! cannot stall the test run. Failures are rendered with truncated stdout and
//! stderr to keep diagnostics readable.

use std::borrow::Cow;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::Report;
use color_eyre::eyre::{Context, eyre};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::observability::LOG_TARGET;

pub(crate) const OUTPUT_CHAR_LIMIT: usize = 2_048;
pub(crate) const TRUNCATION_SUFFIX: &str = "… [truncated]";

/// Locates `PostgreSQL` binaries either in a configured directory or on
/// `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Toolchain {
    bin_dir: Option<Utf8PathBuf>,
}

impl Toolchain {
    pub(crate) const fn new(bin_dir: Option<Utf8PathBuf>) -> Self {
        Self { bin_dir }
    }

    pub(crate) fn program(&self, name: &str) -> OsString {
        self.bin_dir.as_ref().map_or_else(
            || OsString::from(name),
            |dir| dir.join(name).into_string().into(),
        )
    }

    pub(crate) fn command(&self, name: &str) -> Command {
        let mut command = Command::new(self.program(name));
        command.stdin(Stdio::null());
        command
    }
}

/// Runs `command` to completion, killing it once `timeout` elapses.
///
/// `context` names the operation in error messages, e.g. `"initdb"`.
pub(crate) fn run_utility(
    command: &mut Command,
    context: &str,
    timeout: Duration,
) -> Result<Output, Report> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    debug!(target: LOG_TARGET, command = ?command, "running utility");

    let mut child = command
        .spawn()
        .wrap_err_with(|| format!("failed to spawn {context}"))?;

    let exited = child
        .wait_timeout(timeout)
        .wrap_err_with(|| format!("failed to wait for {context}"))?;
    if exited.is_none() {
        match child.kill() {
            // `InvalidInput` indicates the child has already exited.
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(eyre!(
                    "failed to terminate {context} after {}s: {err}",
                    timeout.as_secs()
                ));
            }
        }
    }

    let output = child
        .wait_with_output()
        .wrap_err_with(|| format!("failed to collect {context} output"))?;

    if exited.is_none() {
        return Err(render_failure(
            &format!("{context} timed out after {}s", timeout.as_secs()),
            &output,
        ));
    }
    if !output.status.success() {
        return Err(render_failure(
            &format!("{context} exited with {}", output.status),
            &output,
        ));
    }
    Ok(output)
}

pub(crate) fn render_failure(context: &str, output: &Output) -> Report {
    let stdout = truncate_output(String::from_utf8_lossy(&output.stdout));
    let stderr = truncate_output(String::from_utf8_lossy(&output.stderr));
    eyre!("{context}\nstdout: {stdout}\nstderr: {stderr}")
}

pub(crate) fn truncate_output(text: Cow<'_, str>) -> String {
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.len());
    let mut chars = text.chars();
    for _ in 0..OUTPUT_CHAR_LIMIT {
        match chars.next() {
            Some(ch) => out.push(ch),
            None => return text.into_owned(),
        }
    }

    if chars.next().is_none() {
        return text.into_owned();
    }

    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Returns the last [`OUTPUT_CHAR_LIMIT`] characters of a log file, or an
/// empty string when it cannot be read.
pub(crate) fn log_tail(path: &Path) -> String {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let total = contents.chars().count();
    if total <= OUTPUT_CHAR_LIMIT {
        return contents;
    }
    let tail: String = contents.chars().skip(total - OUTPUT_CHAR_LIMIT).collect();
    format!("[truncated] …{tail}")
}
