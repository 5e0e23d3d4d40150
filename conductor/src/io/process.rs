//! Child process execution for command-backed collaborators.
//!
//! Collaborators receive one JSON request on stdin and may write arbitrary
//! amounts of output. Both output pipes are drained and stdin is fed from
//! separate threads, so a child that writes before it finishes reading cannot
//! wedge the engine.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use super::config::CommandConfig;

const CHUNK: usize = 8192;

/// Bytes kept from one output stream and the count dropped past the limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// One-line description of why the command did not succeed.
    pub fn failure_summary(&self, label: &str) -> String {
        if self.timed_out {
            return format!("{label} timed out");
        }
        let stderr = self.stderr.text();
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty());
        match (self.status.code(), last) {
            (Some(code), Some(line)) => format!("{label} exited with {code}: {}", line.trim()),
            (Some(code), None) => format!("{label} exited with {code}"),
            (None, _) => format!("{label} terminated by signal"),
        }
    }
}

/// Run a configured collaborator command in `cwd`, feeding `stdin` to it.
pub fn run_configured(config: &CommandConfig, cwd: &Path, stdin: &[u8]) -> Result<CommandOutput> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| anyhow!("collaborator command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    run_command_with_timeout(cmd, Some(stdin), config.timeout(), config.output_limit_bytes)
        .with_context(|| format!("run {program}"))
}

/// Run `cmd` to completion or until `timeout`, after which it is killed.
///
/// At most `output_limit_bytes` of each stream is kept; the rest is still read
/// so the child never blocks on a full pipe.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "spawned collaborator");

    let stdout = drain(taken(child.stdout.take(), "stdout")?, output_limit_bytes);
    let stderr = drain(taken(child.stderr.take(), "stderr")?, output_limit_bytes);
    let feeder = match stdin {
        Some(input) => Some(feed(taken(child.stdin.take(), "stdin")?, input.to_vec())),
        None => None,
    };

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    if let Some(feeder) = feeder {
        joined(feeder, "stdin")?;
    }
    let stdout = joined(stdout, "stdout")?;
    let stderr = joined(stderr, "stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn taken<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| anyhow!("{name} was not piped"))
}

fn joined<T>(handle: JoinHandle<Result<T>>, name: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} thread panicked"))?
        .with_context(|| format!("{name} pipe"))
}

fn feed(mut pipe: ChildStdin, input: Vec<u8>) -> JoinHandle<Result<()>> {
    thread::spawn(move || match pipe.write_all(&input) {
        // A child that exits (or is killed) without reading all of stdin is not our failure.
        Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err.into()),
        _ => Ok(()),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R, limit: usize) -> JoinHandle<Result<Captured>> {
    thread::spawn(move || {
        let mut captured = Captured::default();
        let mut chunk = [0u8; CHUNK];
        loop {
            let n = reader.read(&mut chunk).context("read output")?;
            if n == 0 {
                return Ok(captured);
            }
            let keep = n.min(limit.saturating_sub(captured.bytes.len()));
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.dropped += n - keep;
        }
    })
}
