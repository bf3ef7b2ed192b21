use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{MsiPayload, EXIT_SYNTHETIC};

/// How long output readers may keep draining after the process is gone.
/// Shared by both streams.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Time between SIGTERM and SIGKILL when a process group is terminated.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Per-stream capture limit.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Stderr text for a command killed because the agent is stopping.
pub const SHUTDOWN_MESSAGE: &str = "agent shutting down";

/// One OS-level thing to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecRequest {
    /// Explicit argv, first element is the program
    Argv(Vec<String>),
    /// Single command line for the platform shell
    Shell(String),
    /// PowerShell script text
    PowerShell(String),
    /// Windows installer install/uninstall
    Msi(MsiPayload),
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited,
    TimedOut,
    Cancelled,
    FailedToStart,
}

/// Captured result of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExecOutcome,
}

impl CommandResult {
    pub fn exited(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            outcome: ExecOutcome::Exited,
        }
    }

    pub fn synthetic(outcome: ExecOutcome, stdout: String, stderr: String) -> Self {
        Self {
            exit_code: EXIT_SYNTHETIC,
            stdout,
            stderr,
            outcome,
        }
    }

    pub fn exited_ok(&self) -> bool {
        self.outcome == ExecOutcome::Exited && self.exit_code == 0
    }
}

/// Runs a single request to completion, timeout or cancellation.
///
/// Implementations never fail: problems are folded into the returned
/// [`CommandResult`] with the synthetic exit code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        request: &ExecRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandResult;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Translate a request into program and arguments for this platform.
pub fn build_invocation(request: &ExecRequest) -> Option<(String, Vec<String>)> {
    match request {
        ExecRequest::Argv(argv) => {
            let (program, args) = argv.split_first()?;
            Some((program.clone(), args.to_vec()))
        }
        ExecRequest::Shell(line) => {
            if cfg!(windows) {
                Some(("cmd.exe".to_string(), vec!["/C".to_string(), line.clone()]))
            } else {
                Some(("sh".to_string(), vec!["-c".to_string(), line.clone()]))
            }
        }
        ExecRequest::PowerShell(script) => {
            let program = if cfg!(windows) { "powershell.exe" } else { "pwsh" };
            Some((
                program.to_string(),
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-Command".to_string(),
                    script.clone(),
                ],
            ))
        }
        ExecRequest::Msi(msi) => {
            let target = msi.target()?;
            let action = if msi.uninstall { "/x" } else { "/i" };
            let mut args = vec![
                action.to_string(),
                target.to_string(),
                "/qn".to_string(),
                "/norestart".to_string(),
            ];
            args.extend(msi.args.iter().cloned());
            Some(("msiexec.exe".to_string(), args))
        }
    }
}

enum ExitReason {
    Completed(std::process::ExitStatus),
    WaitError(std::io::Error),
    Timeout,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(
        &self,
        request: &ExecRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let Some((program, args)) = build_invocation(request) else {
            return CommandResult::synthetic(
                ExecOutcome::FailedToStart,
                String::new(),
                "nothing to execute: empty command".to_string(),
            );
        };

        tracing::debug!(program = %program, args = ?args, timeout_secs = timeout.as_secs(), "Spawning process");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout takes down the shell and everything it started
        let mut child: AsyncGroupChild = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program = %program, error = %e, "Failed to start process");
                return CommandResult::synthetic(
                    ExecOutcome::FailedToStart,
                    String::new(),
                    format!("failed to start {}: {}", program, e),
                );
            }
        };

        let stdout = SharedCapture::default();
        let stderr = SharedCapture::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.inner().stdout.take() {
            readers.push(tokio::spawn(capture(pipe, stdout.clone())));
        }
        if let Some(pipe) = child.inner().stderr.take() {
            readers.push(tokio::spawn(capture(pipe, stderr.clone())));
        }

        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => ExitReason::WaitError(e),
            },
            _ = tokio::time::sleep(timeout) => ExitReason::Timeout,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        if matches!(exit_reason, ExitReason::Timeout | ExitReason::Cancelled) {
            terminate_process_group(&mut child, KILL_GRACE).await;
        }

        drain(readers).await;
        let stdout = stdout.into_text();
        let mut stderr = stderr.into_text();

        match exit_reason {
            // Killed by a signal on unix: no exit code
            ExitReason::Completed(status) => {
                CommandResult::exited(status.code().unwrap_or(EXIT_SYNTHETIC), stdout, stderr)
            }
            ExitReason::WaitError(e) => {
                tracing::error!(program = %program, error = %e, "Waiting on process failed");
                append_line(&mut stderr, &format!("failed to wait for {}: {}", program, e));
                CommandResult::synthetic(ExecOutcome::Exited, stdout, stderr)
            }
            ExitReason::Timeout => {
                tracing::warn!(program = %program, timeout_secs = timeout.as_secs(), "Process timed out");
                append_line(
                    &mut stderr,
                    &format!("timed out after {}s", timeout.as_secs()),
                );
                CommandResult::synthetic(ExecOutcome::TimedOut, stdout, stderr)
            }
            ExitReason::Cancelled => {
                tracing::info!(program = %program, "Process killed for agent shutdown");
                append_line(&mut stderr, SHUTDOWN_MESSAGE);
                CommandResult::synthetic(ExecOutcome::Cancelled, stdout, stderr)
            }
        }
    }
}

/// SIGTERM the whole group, give it [`KILL_GRACE`] to go, then SIGKILL
/// whatever is left and reap the leader.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let pgid = Pid::from_raw(-(pid as i32));

    if let Err(e) = signal::kill(pgid, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGTERM to process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The leader may be gone while children that ignored SIGTERM live on
    if let Err(e) = signal::kill(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGKILL to process group failed");
        }
    }

    if let Err(e) = child.wait().await {
        tracing::warn!(pid, error = %e, "Failed to reap process");
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill process group");
    }
    let _ = child.wait().await;
}

/// Output collected by a reader task. Lives outside the task so whatever was
/// read survives the task being aborted.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

#[derive(Debug, Clone, Default)]
struct SharedCapture(Arc<Mutex<Captured>>);

impl SharedCapture {
    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, chunk: &[u8]) {
        let mut captured = self.lock();
        let room = MAX_CAPTURE_BYTES.saturating_sub(captured.bytes.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_text(self) -> String {
        let captured = self.lock();
        let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
        if captured.truncated {
            text.push_str("\n... [truncated]\n");
        }
        text
    }
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, sink: SharedCapture) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.push(&buf[..n]),
            Err(e) => {
                tracing::warn!(error = %e, "Error reading process output");
                break;
            }
        }
    }
}

/// Wait for the reader tasks under one shared [`DRAIN_GRACE`] deadline. A
/// grandchild that inherited a pipe can otherwise hold it open forever.
async fn drain(readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut reader in readers {
        match tokio::time::timeout_at(deadline, &mut reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Output reader task failed"),
            Err(_) => {
                reader.abort();
                tracing::warn!("Output still open after process exit, keeping what was read");
            }
        }
    }
}

pub(crate) fn append_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
}
