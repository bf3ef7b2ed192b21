use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Schedules an OS restart. Fire-and-forget: implementations must return
/// immediately and never block result reporting.
pub trait RebootScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, reason: String);
}

/// Uses the platform's native delayed-shutdown command. Once scheduled, the
/// restart belongs to the OS and survives the agent exiting.
#[derive(Debug, Clone, Default)]
pub struct SystemReboot;

impl SystemReboot {
    pub fn new() -> Self {
        Self
    }
}

/// Program and arguments for a delayed restart on this platform.
pub fn reboot_command(delay: Duration, reason: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        (
            "shutdown.exe".to_string(),
            vec![
                "/r".to_string(),
                "/t".to_string(),
                delay.as_secs().to_string(),
                "/c".to_string(),
                reason.to_string(),
            ],
        )
    } else {
        // shutdown(8) only takes whole minutes
        let minutes = delay.as_secs().div_ceil(60);
        (
            "shutdown".to_string(),
            vec!["-r".to_string(), format!("+{}", minutes), reason.to_string()],
        )
    }
}

impl RebootScheduler for SystemReboot {
    fn schedule(&self, delay: Duration, reason: String) {
        let (program, args) = reboot_command(delay, &reason);
        tracing::warn!(delay_secs = delay.as_secs(), reason = %reason, "Scheduling system restart");

        tokio::spawn(async move {
            let output = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    tracing::info!(program = %program, "System restart scheduled");
                }
                Ok(out) => {
                    tracing::error!(
                        program = %program,
                        exit_code = ?out.status.code(),
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "Restart command failed"
                    );
                }
                Err(e) => {
                    tracing::error!(program = %program, error = %e, "Failed to run restart command");
                }
            }
        });
    }
}
