use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::executor::{
    append_line, CommandResult, CommandRunner, ExecOutcome, ExecRequest, SHUTDOWN_MESSAGE,
};
use crate::error::FleetError;
use crate::protocol::{
    stage_timeouts, CommandPayload, CommandType, JobPayload, PendingJob, EXIT_REBOOT_REQUIRED,
    EXIT_SYNTHETIC,
};

/// Prefix on stderr when the pre-script aborts a job.
pub const PRE_SCRIPT_FAILED: &str = "Pre-script failed:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreScript,
    Main,
    PostScript,
}

impl Stage {
    fn marker(self) -> &'static str {
        match self {
            Stage::PreScript => "=== pre-script ===",
            Stage::Main => "=== main ===",
            Stage::PostScript => "=== post-script ===",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::PreScript => write!(f, "pre-script"),
            Stage::Main => write!(f, "main command"),
            Stage::PostScript => write!(f, "post-script"),
        }
    }
}

/// Result of running a job's full script chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Definition asked for a reboot or the main command returned 3010
    pub reboot_required: bool,
    /// The job asks the agent process to restart itself
    pub restart_agent: bool,
    /// A stage was killed because the agent is shutting down
    pub interrupted: bool,
}

/// Stage-marked stdout/stderr accumulated across the chain.
#[derive(Debug, Default)]
struct CombinedLog {
    stdout: String,
    stderr: String,
}

impl CombinedLog {
    fn record(&mut self, stage: Stage, result: &CommandResult) {
        append_line(&mut self.stdout, stage.marker());
        append_line(&mut self.stdout, result.stdout.trim_end_matches('\n'));
        if !result.stderr.is_empty() {
            append_line(&mut self.stderr, stage.marker());
            append_line(&mut self.stderr, result.stderr.trim_end_matches('\n'));
        }
    }

    fn note(&mut self, line: &str) {
        append_line(&mut self.stderr, line);
    }
}

/// Runs pre-script, main command and post-script in order.
#[derive(Clone)]
pub struct ScriptComposer {
    runner: Arc<dyn CommandRunner>,
}

impl ScriptComposer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn compose(&self, job: &PendingJob, cancel: &CancellationToken) -> Composition {
        let (total, aux) = stage_timeouts(job.timeout_seconds);
        let mut log = CombinedLog::default();

        let payload = match JobPayload::decode(job.command_type, &job.command_payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(instance_id = %job.instance_id, error = %e, "Rejecting job with bad payload");
                return Composition {
                    success: false,
                    exit_code: EXIT_SYNTHETIC,
                    stdout: String::new(),
                    stderr: match e {
                        FleetError::InvalidPayload(msg) => format!("invalid command payload: {}", msg),
                        other => other.to_string(),
                    },
                    reboot_required: false,
                    restart_agent: false,
                    interrupted: false,
                };
            }
        };

        // 1. pre-script: any failure aborts the job
        if let Some(script) = non_empty(&job.pre_script) {
            let result = self
                .run_stage(Stage::PreScript, &script_request(script), aux, cancel, &mut log)
                .await;
            if !result.exited_ok() {
                tracing::warn!(
                    instance_id = %job.instance_id,
                    exit_code = result.exit_code,
                    "Pre-script failed, skipping main command"
                );
                let stderr = format!(
                    "{} exit code {}\n{}",
                    PRE_SCRIPT_FAILED, result.exit_code, log.stderr
                );
                return Composition {
                    success: false,
                    exit_code: result.exit_code,
                    stdout: log.stdout,
                    stderr: stderr.trim_end().to_string(),
                    reboot_required: false,
                    restart_agent: false,
                    interrupted: result.outcome == ExecOutcome::Cancelled,
                };
            }
        }

        // 2. main command
        let restart_agent = payload == JobPayload::RestartAgent;
        let main = match main_request(job.command_type, payload) {
            Some(request) => {
                self.run_stage(Stage::Main, &request, total, cancel, &mut log)
                    .await
            }
            None => {
                let result = CommandResult::exited(
                    0,
                    "agent restart requested".to_string(),
                    String::new(),
                );
                log.record(Stage::Main, &result);
                result
            }
        };
        let success = main.outcome == ExecOutcome::Exited
            && (main.exit_code == 0 || main.exit_code == EXIT_REBOOT_REQUIRED);
        let reboot_required =
            success && (job.requires_reboot || main.exit_code == EXIT_REBOOT_REQUIRED);
        let mut interrupted = main.outcome == ExecOutcome::Cancelled;

        // 3. post-script: best effort
        if success {
            if let Some(script) = non_empty(&job.post_script) {
                let post = self
                    .run_stage(Stage::PostScript, &script_request(script), aux, cancel, &mut log)
                    .await;
                if !post.exited_ok() {
                    tracing::warn!(
                        instance_id = %job.instance_id,
                        exit_code = post.exit_code,
                        "Post-script failed, job result unchanged"
                    );
                    log.note(&format!(
                        "post-script failed with exit code {} (ignored)",
                        post.exit_code
                    ));
                }
                interrupted |= post.outcome == ExecOutcome::Cancelled;
            }
        }

        Composition {
            success,
            exit_code: main.exit_code,
            stdout: log.stdout,
            stderr: log.stderr,
            reboot_required,
            restart_agent: restart_agent && success,
            interrupted,
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &ExecRequest,
        timeout: Duration,
        cancel: &CancellationToken,
        log: &mut CombinedLog,
    ) -> CommandResult {
        let mut result = if cancel.is_cancelled() {
            CommandResult::synthetic(
                ExecOutcome::Cancelled,
                String::new(),
                SHUTDOWN_MESSAGE.to_string(),
            )
        } else {
            self.runner.run(request, timeout, cancel).await
        };

        if result.outcome == ExecOutcome::TimedOut {
            append_line(
                &mut result.stderr,
                &format!("{} timed out after {}s", stage, timeout.as_secs()),
            );
        }
        log.record(stage, &result);
        result
    }
}

fn non_empty(script: &Option<String>) -> Option<&str> {
    script.as_deref().filter(|s| !s.trim().is_empty())
}

/// Pre/post scripts and inline `script` bodies: PowerShell on Windows, `sh`
/// everywhere else.
fn script_request(script: &str) -> ExecRequest {
    if cfg!(windows) {
        ExecRequest::PowerShell(script.to_string())
    } else {
        ExecRequest::Shell(script.to_string())
    }
}

fn main_request(command_type: CommandType, payload: JobPayload) -> Option<ExecRequest> {
    match payload {
        JobPayload::RestartAgent => None,
        JobPayload::Msi(msi) => Some(ExecRequest::Msi(msi)),
        JobPayload::Command(CommandPayload::Argv(argv)) => Some(ExecRequest::Argv(argv)),
        JobPayload::Command(CommandPayload::Shell(text) | CommandPayload::Script(text))
            if command_type == CommandType::Powershell =>
        {
            Some(ExecRequest::PowerShell(text))
        }
        JobPayload::Command(CommandPayload::Shell(line)) => Some(ExecRequest::Shell(line)),
        JobPayload::Command(CommandPayload::Script(body)) => Some(script_request(&body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powershell_type_always_runs_powershell() {
        let request = main_request(
            CommandType::Powershell,
            JobPayload::Command(CommandPayload::Shell("Get-Service".into())),
        );
        assert_eq!(request, Some(ExecRequest::PowerShell("Get-Service".into())));
    }

    #[test]
    fn command_type_keeps_argv() {
        let request = main_request(
            CommandType::Command,
            JobPayload::Command(CommandPayload::Argv(vec!["hostname".into()])),
        );
        assert_eq!(request, Some(ExecRequest::Argv(vec!["hostname".into()])));
    }

    #[test]
    fn restart_agent_has_no_process() {
        assert_eq!(main_request(CommandType::RestartAgent, JobPayload::RestartAgent), None);
    }

    #[test]
    fn empty_scripts_are_skipped() {
        assert_eq!(non_empty(&Some("  \n".to_string())), None);
        assert_eq!(non_empty(&Some("echo".to_string())), Some("echo"));
        assert_eq!(non_empty(&None), None);
    }
}
