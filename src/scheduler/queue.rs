use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{JobResult, PendingJob};
use crate::scheduler::job::{JobDefinition, JobInstance, JobStatus};

const DEFAULT_MAX_INSTANCES: usize = 100_000;

/// Stderr recorded when a running attempt never reported back.
pub const LOST_RESULT_MESSAGE: &str = "result was never reported";

/// What a maintenance sweep changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Lost attempts put back for another try
    pub requeued: Vec<Uuid>,
    /// Lost attempts with no attempts left
    pub failed: Vec<Uuid>,
    /// Unclaimed instances whose scheduling window closed
    pub expired: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.expired.is_empty()
    }
}

/// Job definitions and their per-node instances.
///
/// Every state transition happens through `&mut self`, so callers holding the
/// queue behind a write lock get compare-and-set semantics for free: of two
/// concurrent claims on one instance, exactly one observes it claimable.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, JobDefinition>,
    instances: HashMap<Uuid, JobInstance>,
    next_seq: u64,
    max_instances: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_INSTANCES)
    }

    pub fn with_capacity(max_instances: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            instances: HashMap::new(),
            next_seq: 0,
            max_instances,
        }
    }

    /// Store a definition and create one instance per node.
    /// Returns the new instance ids in node order.
    pub fn create_job(&mut self, job: JobDefinition, node_ids: Vec<String>) -> Result<Vec<Uuid>> {
        if self.instances.len() + node_ids.len() > self.max_instances {
            return Err(FleetError::QueueFull(self.max_instances));
        }

        let mut ids = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let instance = JobInstance::new(&job, node_id, self.next_seq);
            self.next_seq += 1;
            ids.push(instance.id);
            self.instances.insert(instance.id, instance);
        }

        tracing::info!(
            job_id = %job.id,
            name = %job.name,
            target = %job.target,
            instances = ids.len(),
            "Job created"
        );
        self.jobs.insert(job.id, job);
        Ok(ids)
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&JobDefinition> {
        self.jobs.get(id)
    }

    pub fn get_instance(&self, id: &Uuid) -> Option<&JobInstance> {
        self.instances.get(id)
    }

    /// All definitions, oldest first.
    pub fn all_jobs(&self) -> Vec<&JobDefinition> {
        let mut jobs: Vec<&JobDefinition> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Instances of one job in creation order.
    pub fn instances_for_job(&self, job_id: &Uuid) -> Vec<&JobInstance> {
        let mut instances: Vec<&JobInstance> = self
            .instances
            .values()
            .filter(|i| i.job_id == *job_id)
            .collect();
        instances.sort_by_key(|i| i.seq);
        instances
    }

    pub fn status_counts(&self, job_id: &Uuid) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for instance in self.instances.values().filter(|i| i.job_id == *job_id) {
            *counts.entry(instance.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Claimable work for one node, oldest first.
    ///
    /// Only instances bound to `node_id` are considered, and only while their
    /// job's scheduling window is open.
    pub fn pending_for_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<Vec<PendingJob>> {
        let mut instances: Vec<(&JobInstance, &JobDefinition)> = self
            .instances
            .values()
            .filter(|i| i.node_id == node_id && i.status.is_claimable())
            .filter_map(|i| self.jobs.get(&i.job_id).map(|job| (i, job)))
            .filter(|(_, job)| job.window_open(now))
            .collect();
        instances.sort_by_key(|(i, _)| (i.created_at, i.seq));

        instances
            .into_iter()
            .map(|(instance, job)| instance.to_pending(job))
            .collect()
    }

    fn instance_for_node(&mut self, id: &Uuid, node_id: &str) -> Result<&mut JobInstance> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(FleetError::InstanceNotFound(*id))?;
        if instance.node_id != node_id {
            return Err(FleetError::NodeMismatch {
                instance_id: *id,
                bound_node: instance.node_id.clone(),
                caller: node_id.to_string(),
            });
        }
        Ok(instance)
    }

    /// Claim an instance for its node: pending|queued -> running.
    pub fn claim(&mut self, id: &Uuid, node_id: &str, now: DateTime<Utc>) -> Result<&JobInstance> {
        let instance = self.instance_for_node(id, node_id)?;
        if !instance.status.is_claimable() {
            return Err(FleetError::InvalidTransition {
                instance_id: *id,
                from: instance.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        instance.status = JobStatus::Running;
        instance.attempt += 1;
        instance.started_at = Some(now);
        instance.completed_at = None;
        tracing::info!(
            instance_id = %id,
            node_id,
            attempt = instance.attempt,
            max_attempts = instance.max_attempts,
            "Instance claimed"
        );
        Ok(instance)
    }

    /// Apply an agent's result to a running instance.
    ///
    /// A failed attempt goes back to `queued` while attempts remain.
    pub fn record_result(
        &mut self,
        id: &Uuid,
        node_id: &str,
        result: &JobResult,
    ) -> Result<&JobInstance> {
        let instance = self.instance_for_node(id, node_id)?;
        if instance.status != JobStatus::Running {
            let to = if result.success {
                JobStatus::Success
            } else {
                JobStatus::Failed
            };
            return Err(FleetError::InvalidTransition {
                instance_id: *id,
                from: instance.status.to_string(),
                to: to.to_string(),
            });
        }

        instance.status = if result.success {
            JobStatus::Success
        } else if instance.attempts_remaining() {
            JobStatus::Queued
        } else {
            JobStatus::Failed
        };
        instance.exit_code = Some(result.exit_code);
        instance.stdout = Some(result.stdout.clone());
        instance.stderr = Some(result.stderr.clone());
        instance.started_at = Some(result.started_at);
        instance.completed_at = Some(result.completed_at);

        tracing::info!(
            instance_id = %id,
            node_id,
            status = %instance.status,
            exit_code = result.exit_code,
            attempt = instance.attempt,
            "Instance result recorded"
        );
        Ok(instance)
    }

    /// Cancel an instance that no agent has claimed.
    pub fn cancel_instance(&mut self, id: &Uuid, now: DateTime<Utc>) -> Result<&JobInstance> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(FleetError::InstanceNotFound(*id))?;
        if !instance.status.is_claimable() {
            return Err(FleetError::InvalidTransition {
                instance_id: *id,
                from: instance.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }
        instance.status = JobStatus::Cancelled;
        instance.completed_at = Some(now);
        Ok(instance)
    }

    /// Cancel every unclaimed instance of a job. Returns how many changed.
    pub fn cancel_job(&mut self, job_id: &Uuid, now: DateTime<Utc>) -> Result<usize> {
        if !self.jobs.contains_key(job_id) {
            return Err(FleetError::JobNotFound(*job_id));
        }
        let mut cancelled = 0;
        for instance in self
            .instances
            .values_mut()
            .filter(|i| i.job_id == *job_id && i.status.is_claimable())
        {
            instance.status = JobStatus::Cancelled;
            instance.completed_at = Some(now);
            cancelled += 1;
        }
        tracing::info!(job_id = %job_id, cancelled, "Job cancelled");
        Ok(cancelled)
    }

    /// Requeue or fail running instances whose result is overdue, and cancel
    /// unclaimed instances whose scheduling window has closed.
    pub fn sweep(&mut self, now: DateTime<Utc>, grace: chrono::Duration) -> SweepReport {
        let mut report = SweepReport::default();

        for instance in self.instances.values_mut() {
            let Some(job) = self.jobs.get(&instance.job_id) else {
                continue;
            };

            match instance.status {
                JobStatus::Running => {
                    let Some(started) = instance.started_at else {
                        continue;
                    };
                    // All stages at their own timeouts, not just the main command
                    let budget = chrono::Duration::from_std(job.command.max_run_time())
                        .unwrap_or(chrono::Duration::MAX);
                    let deadline = started
                        .checked_add_signed(budget)
                        .and_then(|d| d.checked_add_signed(grace));
                    if deadline.is_none_or(|deadline| now <= deadline) {
                        continue;
                    }
                    if instance.attempts_remaining() {
                        instance.status = JobStatus::Queued;
                        report.requeued.push(instance.id);
                    } else {
                        instance.status = JobStatus::Failed;
                        instance.exit_code = Some(crate::protocol::EXIT_SYNTHETIC);
                        instance.stderr = Some(LOST_RESULT_MESSAGE.to_string());
                        instance.completed_at = Some(now);
                        report.failed.push(instance.id);
                    }
                    tracing::warn!(
                        instance_id = %instance.id,
                        node_id = %instance.node_id,
                        status = %instance.status,
                        "Running instance never reported a result"
                    );
                }
                JobStatus::Pending | JobStatus::Queued if job.window_closed(now) => {
                    instance.status = JobStatus::Cancelled;
                    instance.completed_at = Some(now);
                    report.expired.push(instance.id);
                }
                _ => {}
            }
        }

        report
    }

    /// Returns the current number of instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if the queue holds no instances
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.instances.len() >= self.max_instances
    }
}
