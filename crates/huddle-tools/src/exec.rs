// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Streamed subprocess execution with timeout and output caps.
//!
//! Commands run under `bash -c` with stdin closed and no controlling
//! terminal access.  Both output streams are pumped concurrently: every
//! decoded chunk is handed to the caller's streaming callback as it
//! arrives AND accumulated into the final record.  Exceeding the
//! per-stream byte cap or the wall-clock timeout kills the process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::classify::CommandClass;

/// One decoded chunk of subprocess output, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecChunk {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    /// Per-stream cap; crossing it kills the process.
    pub max_buffer_bytes: usize,
    pub cwd: Option<PathBuf>,
}

impl ExecRequest {
    /// Build a request with category-default timeout and buffer cap.
    pub fn for_class(command: impl Into<String>, class: &CommandClass) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(class.default_timeout_secs()),
            max_buffer_bytes: class.default_max_buffer_bytes(),
            cwd: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// `None` when the process was killed (timeout, cap) or died on a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// An output stream crossed `max_buffer_bytes`.
    pub truncated: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.truncated
    }
}

/// Run a command, streaming output chunks through `on_chunk`.
///
/// `Err` is reserved for spawn failures; a command that runs and fails
/// (non-zero exit, timeout, truncation) is an `Ok` outcome the caller
/// turns into a failed tool result.  The callback must not block: it is
/// invoked from the read loop.
pub async fn run_streamed<F>(req: &ExecRequest, mut on_chunk: F) -> anyhow::Result<ExecOutcome>
where
    F: FnMut(ExecChunk) + Send,
{
    debug!(cmd = %req.command, timeout = ?req.timeout, "spawning subprocess");

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(&req.command);
    // stdin is closed so the child never waits on terminal input; a
    // killed future must also take the process down with it.
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let mut outcome = ExecOutcome::default();
    let deadline = tokio::time::Instant::now() + req.timeout;

    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => match n {
                Ok(0) => out_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&out_buf[..n]).into_owned();
                    outcome.stdout.push_str(&chunk);
                    on_chunk(ExecChunk::Stdout(chunk));
                    if outcome.stdout.len() > req.max_buffer_bytes {
                        outcome.truncated = true;
                        break;
                    }
                }
                Err(_) => out_open = false,
            },
            n = stderr.read(&mut err_buf), if err_open => match n {
                Ok(0) => err_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&err_buf[..n]).into_owned();
                    outcome.stderr.push_str(&chunk);
                    on_chunk(ExecChunk::Stderr(chunk));
                    if outcome.stderr.len() > req.max_buffer_bytes {
                        outcome.truncated = true;
                        break;
                    }
                }
                Err(_) => err_open = false,
            },
            _ = tokio::time::sleep_until(deadline) => {
                outcome.timed_out = true;
                break;
            }
        }
    }

    if outcome.timed_out || outcome.truncated {
        let _ = child.start_kill();
        // Reap so the kill does not leave a zombie behind.
        let _ = child.wait().await;
        return Ok(outcome);
    }

    // Streams are drained; wait (bounded) for the exit status.
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => outcome.exit_code = status.code(),
        Ok(Err(_)) => {}
        Err(_) => {
            outcome.timed_out = true;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    Ok(outcome)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
