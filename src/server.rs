use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::error::{FleetError, Result};
use crate::scheduler::{JobQueue, NodeRegistry};

/// The central job queue: HTTP API plus the maintenance loop.
pub struct QueueServer {
    pub config: ServerConfig,
    pub state: ApiState,
}

impl QueueServer {
    pub fn new(config: ServerConfig) -> Self {
        let stale_after = chrono::Duration::from_std(config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let state = ApiState::new(
            JobQueue::with_capacity(config.max_instances),
            NodeRegistry::new(),
            stale_after,
        );
        Self { config, state }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Spawns the maintenance loop and serves the API on the current task.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let sweep_state = self.state.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_interval = self.config.sweep_interval;
        let grace = chrono::Duration::from_std(self.config.result_grace)
            .map_err(|e| FleetError::Internal(format!("result grace out of range: {}", e)))?;
        let sweeper = tokio::spawn(async move {
            Self::maintenance_loop(sweep_state, sweep_interval, grace, sweep_shutdown).await;
        });

        let result = run_api(self.config.listen_addr, self.state, shutdown.clone()).await;
        shutdown.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Maintenance loop ended abnormally");
        }
        result
    }

    /// Periodically requeue lost attempts and expire closed scheduling windows.
    pub async fn maintenance_loop(
        state: ApiState,
        interval: std::time::Duration,
        grace: chrono::Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = state.queue.write().await.sweep(Utc::now(), grace);
                    if !report.is_empty() {
                        tracing::info!(
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            expired = report.expired.len(),
                            "Maintenance sweep"
                        );
                    }
                }
            }
        }
        tracing::debug!("Maintenance loop stopped");
    }
}
