//! Wire types shared by the queue API and the agent.
//!
//! All bodies are camelCase JSON. The command payload travels as a
//! JSON-encoded string inside [`PendingJob`] and is decoded into
//! [`JobPayload`] only at the point of execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// Header carrying the caller's node id on every agent request.
pub const NODE_ID_HEADER: &str = "x-node-id";

/// Windows installer "success, reboot required".
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;

/// Agent-synthesized exit code: start failure, timeout, shutdown, bad payload.
pub const EXIT_SYNTHETIC: i32 = -1;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_REBOOT_DELAY_SECONDS: u64 = 60;

/// Pre- and post-scripts get this fraction of the job timeout.
pub const AUX_TIMEOUT_DIVISOR: u32 = 4;

/// Floor for any single stage timeout.
pub const MIN_STAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on what an agent spends past a stage's timeout: terminating
/// the process group and draining its output.
pub const STAGE_OVERHEAD: Duration = Duration::from_secs(10);

/// Main-command and pre/post-script timeouts for a job timeout in seconds.
pub fn stage_timeouts(timeout_seconds: u64) -> (Duration, Duration) {
    let main = Duration::from_secs(timeout_seconds).max(MIN_STAGE_TIMEOUT);
    let aux = (main / AUX_TIMEOUT_DIVISOR).max(MIN_STAGE_TIMEOUT);
    (main, aux)
}

fn has_script(script: &Option<String>) -> bool {
    script.as_deref().is_some_and(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Script,
    Command,
    Powershell,
    Msi,
    RestartAgent,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Script => write!(f, "script"),
            CommandType::Command => write!(f, "command"),
            CommandType::Powershell => write!(f, "powershell"),
            CommandType::Msi => write!(f, "msi"),
            CommandType::RestartAgent => write!(f, "restart-agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    All,
    Group,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    #[default]
    Required,
    Available,
    Uninstall,
}

/// What an operator asks to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub command_type: CommandType,
    #[serde(default)]
    pub command_payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub requires_reboot: bool,
    #[serde(default = "default_reboot_delay")]
    pub reboot_delay_seconds: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_reboot_delay() -> u64 {
    DEFAULT_REBOOT_DELAY_SECONDS
}

impl CommandSpec {
    pub fn new(command_type: CommandType, command_payload: serde_json::Value) -> Self {
        Self {
            command_type,
            command_payload,
            pre_script: None,
            post_script: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            requires_reboot: false,
            reboot_delay_seconds: DEFAULT_REBOOT_DELAY_SECONDS,
        }
    }

    /// Longest an agent can legitimately spend on one attempt: every stage
    /// at its own timeout plus termination and drain overhead.
    pub fn max_run_time(&self) -> Duration {
        let (main, aux) = stage_timeouts(self.timeout_seconds);
        let mut budget = main + STAGE_OVERHEAD;
        for script in [&self.pre_script, &self.post_script] {
            if has_script(script) {
                budget += aux + STAGE_OVERHEAD;
            }
        }
        budget
    }
}

/// Operator -> queue job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: CommandSpec,
    pub target_type: TargetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub instance_count: usize,
    pub instance_ids: Vec<Uuid>,
}

/// The part of a job instance an agent needs to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub instance_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub command_type: CommandType,
    pub command_payload: String,
    pub timeout_seconds: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,
    #[serde(default)]
    pub requires_reboot: bool,
    #[serde(default = "default_reboot_delay")]
    pub reboot_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobsResponse {
    pub jobs: Vec<PendingJob>,
    pub count: usize,
}

/// Outcome of one execution attempt. The instance id travels in the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(skip)]
    pub instance_id: Uuid,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Node self-registration / group assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Script or command body, decoded from its loosely typed JSON form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    /// `{"command": ["exe", "arg", ...]}`
    Argv(Vec<String>),
    /// `{"command": "single shell string"}`
    Shell(String),
    /// `{"script": "inline script body"}`
    Script(String),
}

/// Installer request: exactly what `msiexec` needs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsiPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_code: Option<String>,
    #[serde(default)]
    pub uninstall: bool,
    #[serde(default)]
    pub args: Vec<String>,
}

impl MsiPayload {
    /// The package reference handed to msiexec: path wins over product code.
    pub fn target(&self) -> Option<&str> {
        let usable = |t: &&str| !t.trim().is_empty();
        self.path
            .as_deref()
            .filter(usable)
            .or(self.product_code.as_deref().filter(usable))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Command(CommandPayload),
    Msi(MsiPayload),
    RestartAgent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommandField {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Deserialize)]
struct RawCommand {
    command: Option<RawCommandField>,
    script: Option<String>,
}

impl JobPayload {
    /// Decode a JSON-encoded payload for the given command type.
    pub fn decode(command_type: CommandType, raw: &str) -> Result<Self> {
        match command_type {
            CommandType::RestartAgent => Ok(JobPayload::RestartAgent),
            CommandType::Msi => {
                let msi: MsiPayload = serde_json::from_str(raw)
                    .map_err(|e| FleetError::InvalidPayload(e.to_string()))?;
                if msi.target().is_none() {
                    return Err(FleetError::InvalidPayload(
                        "msi payload needs a path or productCode".to_string(),
                    ));
                }
                Ok(JobPayload::Msi(msi))
            }
            CommandType::Script | CommandType::Command | CommandType::Powershell => {
                let parsed: RawCommand = serde_json::from_str(raw)
                    .map_err(|e| FleetError::InvalidPayload(e.to_string()))?;
                let payload = match (parsed.command, parsed.script) {
                    (Some(RawCommandField::Argv(argv)), _) => {
                        if argv.first().is_none_or(|exe| exe.trim().is_empty()) {
                            return Err(FleetError::InvalidPayload(
                                "command array is empty".to_string(),
                            ));
                        }
                        CommandPayload::Argv(argv)
                    }
                    (Some(RawCommandField::Shell(line)), _) => CommandPayload::Shell(line),
                    (None, Some(script)) => CommandPayload::Script(script),
                    (None, None) => {
                        return Err(FleetError::InvalidPayload(
                            "expected a \"command\" or \"script\" field".to_string(),
                        ))
                    }
                };
                if let CommandPayload::Shell(text) | CommandPayload::Script(text) = &payload {
                    if text.trim().is_empty() {
                        return Err(FleetError::InvalidPayload("command is empty".to_string()));
                    }
                }
                Ok(JobPayload::Command(payload))
            }
        }
    }
}
