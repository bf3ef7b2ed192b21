use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::client::{ClaimOutcome, JobQueueApi};
use crate::agent::composer::ScriptComposer;
use crate::agent::reboot::RebootScheduler;
use crate::config::AgentConfig;
use crate::protocol::{JobResult, PendingJob};

/// Lower bound on any sleep between cycles, so the loop never spins.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

/// Consecutive transport errors and the backoff they imply.
#[derive(Debug, Clone)]
pub struct PollState {
    consecutive_errors: u32,
    base: Duration,
    max: Duration,
}

impl PollState {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_DELAY);
        Self {
            consecutive_errors: 0,
            base,
            max: max.max(base),
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn record_success(&mut self) {
        if self.consecutive_errors > 0 {
            tracing::info!(
                after_errors = self.consecutive_errors,
                "Queue reachable again"
            );
        }
        self.consecutive_errors = 0;
    }

    /// Count a failure and return the delay before the next attempt:
    /// `min(base * 2^(errors-1), max)`.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.backoff()
    }

    pub fn backoff(&self) -> Duration {
        if self.consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.consecutive_errors - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Why the poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Shutdown was requested
    Shutdown,
    /// A restart-agent job completed; the service manager should start us again
    RestartRequested,
}

/// What happened to one job in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    /// Ran and a result was produced (reporting may still have failed)
    Executed(JobResult),
    /// Claim was rejected and strict claims are on
    Skipped,
}

/// Fetches, claims, runs and reports jobs for one node.
pub struct Poller {
    config: AgentConfig,
    queue: Arc<dyn JobQueueApi>,
    composer: ScriptComposer,
    reboot: Arc<dyn RebootScheduler>,
    state: PollState,
}

impl Poller {
    pub fn new(
        config: AgentConfig,
        queue: Arc<dyn JobQueueApi>,
        composer: ScriptComposer,
        reboot: Arc<dyn RebootScheduler>,
    ) -> Self {
        let state = PollState::new(config.backoff_base, config.backoff_max);
        Self {
            config,
            queue,
            composer,
            reboot,
            state,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Poll until `shutdown` is cancelled or a restart is requested.
    pub async fn run(&mut self, shutdown: CancellationToken) -> AgentExit {
        tracing::info!(
            node_id = %self.config.node_id,
            queue = %self.config.queue_url,
            interval_secs = self.config.poll_interval.as_secs(),
            "Polling loop started"
        );

        loop {
            if shutdown.is_cancelled() {
                return AgentExit::Shutdown;
            }

            let delay = match self.poll_once(&shutdown).await {
                Ok(Some(exit)) => return exit,
                Ok(None) => self.config.poll_interval.max(MIN_DELAY),
                Err(delay) => delay,
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Polling loop stopped");
                    return AgentExit::Shutdown;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One cycle: fetch and run everything pending.
    ///
    /// `Err` carries the backoff delay after a transport error.
    pub async fn poll_once(
        &mut self,
        shutdown: &CancellationToken,
    ) -> std::result::Result<Option<AgentExit>, Duration> {
        let jobs = match self.queue.pending_jobs(&self.config.node_id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                let delay = self.state.record_failure();
                tracing::warn!(
                    error = %e,
                    consecutive_errors = self.state.consecutive_errors(),
                    backoff_secs = delay.as_secs(),
                    "Failed to fetch pending jobs, backing off"
                );
                return Err(delay);
            }
        };
        self.state.record_success();

        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "Received pending jobs");
        }

        for job in jobs {
            if shutdown.is_cancelled() {
                return Ok(Some(AgentExit::Shutdown));
            }
            let (disposition, restart) = self.process_job(&job, shutdown).await;
            if restart && matches!(disposition, JobDisposition::Executed(ref r) if r.success) {
                tracing::info!(instance_id = %job.instance_id, "Restarting agent as requested");
                return Ok(Some(AgentExit::RestartRequested));
            }
            if shutdown.is_cancelled() {
                return Ok(Some(AgentExit::Shutdown));
            }
        }
        Ok(None)
    }

    /// Claim, execute, report and, if needed, schedule a reboot.
    /// The flag is true when the job asked for an agent restart.
    pub async fn process_job(
        &self,
        job: &PendingJob,
        shutdown: &CancellationToken,
    ) -> (JobDisposition, bool) {
        match self.queue.claim(job.instance_id).await {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Rejected { status, reason } => {
                if self.config.strict_claims {
                    tracing::warn!(
                        instance_id = %job.instance_id,
                        status,
                        reason = %reason,
                        "Claim rejected, skipping job"
                    );
                    return (JobDisposition::Skipped, false);
                }
                tracing::warn!(
                    instance_id = %job.instance_id,
                    status,
                    reason = %reason,
                    "Claim rejected, running anyway"
                );
            }
            ClaimOutcome::Unavailable(reason) => {
                tracing::warn!(
                    instance_id = %job.instance_id,
                    reason = %reason,
                    "Could not signal job start, running anyway"
                );
            }
        }

        tracing::info!(
            instance_id = %job.instance_id,
            job = %job.job_name,
            command_type = %job.command_type,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            "Executing job"
        );

        let started_at = Utc::now();
        let composition = self.composer.compose(job, shutdown).await;
        let result = JobResult {
            instance_id: job.instance_id,
            success: composition.success,
            exit_code: composition.exit_code,
            stdout: composition.stdout,
            stderr: composition.stderr,
            started_at,
            completed_at: Utc::now(),
        };

        tracing::info!(
            instance_id = %job.instance_id,
            success = result.success,
            exit_code = result.exit_code,
            interrupted = composition.interrupted,
            "Job finished"
        );

        if let Err(e) = self.queue.report_result(&result).await {
            tracing::warn!(
                instance_id = %job.instance_id,
                error = %e,
                "Failed to report job result, the queue will redeliver"
            );
        }

        if composition.reboot_required {
            let delay = Duration::from_secs(job.reboot_delay_seconds);
            self.reboot.schedule(
                delay,
                format!("fleet job '{}' ({}) requires a restart", job.job_name, job.instance_id),
            );
        }

        (JobDisposition::Executed(result), composition.restart_agent)
    }
}
