use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{CommandSpec, CreateJobRequest, JobMode, PendingJob, TargetType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Waiting for another attempt after a failed or lost one
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses an agent may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a job should run, validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum TargetSpec {
    All,
    Group(String),
    Node(String),
}

impl TargetSpec {
    pub fn from_request(target_type: TargetType, target_id: Option<&str>) -> Result<Self> {
        let id = target_id.map(str::trim).filter(|id| !id.is_empty());
        match (target_type, id) {
            (TargetType::All, _) => Ok(TargetSpec::All),
            (TargetType::Group, Some(id)) => Ok(TargetSpec::Group(id.to_string())),
            (TargetType::Node, Some(id)) => Ok(TargetSpec::Node(id.to_string())),
            (_, None) => Err(FleetError::InvalidTarget(
                "targetId is required unless targetType is \"all\"".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSpec::All => write!(f, "all"),
            TargetSpec::Group(id) => write!(f, "group:{}", id),
            TargetSpec::Node(id) => write!(f, "node:{}", id),
        }
    }
}

/// Operator-authored template. Never modified after instances exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub mode: JobMode,
    pub command: CommandSpec,
    pub target: TargetSpec,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Validate a submission and turn it into a definition.
    pub fn from_request(req: CreateJobRequest) -> Result<Self> {
        if req.name.trim().is_empty() {
            return Err(FleetError::InvalidRequest("name is required".to_string()));
        }
        let target = TargetSpec::from_request(req.target_type, req.target_id.as_deref())?;
        if let (Some(start), Some(end)) = (req.scheduled_start, req.scheduled_end) {
            if end <= start {
                return Err(FleetError::InvalidRequest(
                    "scheduledEnd must be after scheduledStart".to_string(),
                ));
            }
        }

        let mut command = req.command;
        if command.timeout_seconds == 0 {
            return Err(FleetError::InvalidRequest(
                "timeoutSeconds must be positive".to_string(),
            ));
        }
        command.max_attempts = command.max_attempts.max(1);
        if req.mode == JobMode::Uninstall {
            if let Some(obj) = command.command_payload.as_object_mut() {
                obj.insert("uninstall".to_string(), serde_json::Value::Bool(true));
            }
        }

        // Reject payloads agents could never decode
        let encoded = serde_json::to_string(&command.command_payload)?;
        crate::protocol::JobPayload::decode(command.command_type, &encoded)?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            mode: req.mode,
            command,
            target,
            scheduled_start: req.scheduled_start,
            scheduled_end: req.scheduled_end,
            created_at: Utc::now(),
        })
    }

    /// True while `now` is inside the optional scheduling window.
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.is_none_or(|start| now >= start)
            && self.scheduled_end.is_none_or(|end| now < end)
    }

    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_end.is_some_and(|end| now >= end)
    }
}

/// One execution unit bound to exactly one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    pub id: Uuid,
    pub job_id: Uuid,
    pub node_id: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Creation order within the queue, breaks created_at ties
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl JobInstance {
    pub fn new(job: &JobDefinition, node_id: String, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            node_id,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts: job.command.max_attempts,
            seq,
            created_at: job.created_at,
            started_at: None,
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Project this instance into what its agent needs.
    pub fn to_pending(&self, job: &JobDefinition) -> Result<PendingJob> {
        Ok(PendingJob {
            instance_id: self.id,
            job_id: job.id,
            job_name: job.name.clone(),
            command_type: job.command.command_type,
            command_payload: serde_json::to_string(&job.command.command_payload)?,
            timeout_seconds: job.command.timeout_seconds,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            pre_script: job.command.pre_script.clone(),
            post_script: job.command.post_script.clone(),
            requires_reboot: job.command.requires_reboot,
            reboot_delay_seconds: job.command.reboot_delay_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandType;
    use serde_json::json;

    fn request(target_type: TargetType, target_id: Option<&str>) -> CreateJobRequest {
        CreateJobRequest {
            name: "install agent update".to_string(),
            description: None,
            command: CommandSpec::new(CommandType::Msi, json!({"path": "C:\\pkg\\agent.msi"})),
            target_type,
            target_id: target_id.map(str::to_string),
            mode: JobMode::Required,
            scheduled_start: None,
            scheduled_end: None,
        }
    }

    #[test]
    fn target_requires_id_unless_all() {
        assert_eq!(
            TargetSpec::from_request(TargetType::All, None).unwrap(),
            TargetSpec::All
        );
        assert_eq!(
            TargetSpec::from_request(TargetType::Group, Some("servers")).unwrap(),
            TargetSpec::Group("servers".to_string())
        );
        assert!(TargetSpec::from_request(TargetType::Node, None).is_err());
        assert!(TargetSpec::from_request(TargetType::Group, Some("  ")).is_err());
    }

    #[test]
    fn uninstall_mode_forces_msi_uninstall() {
        let mut req = request(TargetType::All, None);
        req.mode = JobMode::Uninstall;
        let job = JobDefinition::from_request(req).unwrap();
        assert_eq!(job.command.command_payload["uninstall"], true);
    }

    #[test]
    fn rejects_undecodable_payload() {
        let mut req = request(TargetType::All, None);
        req.command.command_payload = json!({"uninstall": true});
        assert!(matches!(
            JobDefinition::from_request(req),
            Err(FleetError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rejects_inverted_window() {
        let mut req = request(TargetType::All, None);
        let now = Utc::now();
        req.scheduled_start = Some(now);
        req.scheduled_end = Some(now - chrono::Duration::hours(1));
        assert!(JobDefinition::from_request(req).is_err());
    }

    #[test]
    fn window_checks() {
        let now = Utc::now();
        let mut job = JobDefinition::from_request(request(TargetType::All, None)).unwrap();
        assert!(job.window_open(now));

        job.scheduled_start = Some(now + chrono::Duration::minutes(5));
        assert!(!job.window_open(now));
        assert!(!job.window_closed(now));

        job.scheduled_start = None;
        job.scheduled_end = Some(now - chrono::Duration::minutes(5));
        assert!(!job.window_open(now));
        assert!(job.window_closed(now));
    }

    #[test]
    fn instance_projects_to_pending_job() {
        let job = JobDefinition::from_request(request(TargetType::All, None)).unwrap();
        let instance = JobInstance::new(&job, "node-1".to_string(), 7);
        let pending = instance.to_pending(&job).unwrap();
        assert_eq!(pending.instance_id, instance.id);
        assert_eq!(pending.job_id, job.id);
        assert_eq!(pending.command_type, CommandType::Msi);
        assert_eq!(pending.max_attempts, 3);
        let payload: serde_json::Value = serde_json::from_str(&pending.command_payload).unwrap();
        assert_eq!(payload["path"], "C:\\pkg\\agent.msi");
    }
}
