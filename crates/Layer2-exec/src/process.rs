//! Child process control
//!
//! `run_command` is the single choke point every executor backend funnels
//! through: spawn with piped stdio, stream output lines into the task log as
//! they arrive, collect raw stdout bytes, race completion against the run's
//! kill signal with SIGTERM-then-SIGKILL escalation.

use crate::{KillSignal, TaskLogger};
use conveyor_foundation::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait after SIGTERM before escalating to SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Run a command, streaming combined output into `logger` and returning the
/// raw stdout bytes. Non-zero exit maps to `Error::Command`.
pub async fn run_command(
    argv: &[String],
    logger: &TaskLogger,
    kill: &KillSignal,
) -> Result<Vec<u8>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Task("empty command".to_string()))?;

    debug!(task = logger.task(), command = %argv.join(" "), "spawning");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Task(format!("failed to spawn {}: {}", program, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_handle = stdout.map(|stream| {
        let logger = logger.clone();
        tokio::spawn(async move { stream_lines(stream, &logger, true).await })
    });
    let stderr_handle = stderr.map(|stream| {
        let logger = logger.clone();
        tokio::spawn(async move { stream_lines(stream, &logger, false).await })
    });

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::Task(format!("failed to wait for process: {}", e)))?
        }
        _ = kill.wait() => {
            terminate(&mut child, logger).await;
            drain(stdout_handle, stderr_handle).await;
            return Err(Error::Cancelled);
        }
    };

    let captured = drain(stdout_handle, stderr_handle).await;

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        return Err(Error::Command { exit_code });
    }
    Ok(captured)
}

/// Run a command without log streaming, capturing stdout. Used for plumbing
/// commands (docker cp, scp, tar inspection) whose output is not task output.
pub async fn run_quiet(argv: &[String]) -> Result<Vec<u8>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Task("empty command".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Task(format!("failed to spawn {}: {}", program, e)))?;

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(Error::Command { exit_code });
    }
    Ok(output.stdout)
}

/// Stream a pipe line-by-line into the task log. Stdout lines also accumulate
/// as raw bytes so callers can consume command output programmatically.
async fn stream_lines(
    stream: impl AsyncRead + Unpin,
    logger: &TaskLogger,
    capture: bool,
) -> Vec<u8> {
    let mut reader = BufReader::new(stream);
    let mut captured = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if capture {
                    captured.extend_from_slice(&buf);
                }
                logger.line(String::from_utf8_lossy(&buf).trim_end_matches('\n'));
            }
            Err(e) => {
                warn!(task = logger.task(), "output stream error: {}", e);
                break;
            }
        }
    }
    captured
}

async fn drain(
    stdout: Option<tokio::task::JoinHandle<Vec<u8>>>,
    stderr: Option<tokio::task::JoinHandle<Vec<u8>>>,
) -> Vec<u8> {
    let captured = match stdout {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };
    if let Some(handle) = stderr {
        let _ = handle.await;
    }
    captured
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate(child: &mut Child, logger: &TaskLogger) {
    logger.line("Killing process with SIGTERM");
    send_sigterm(child);
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            logger.line("Process still running: Killing process with SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}
