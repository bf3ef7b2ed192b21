//! Agent side of job dispatch.
//!
//! Each managed node runs one agent process with a single polling task:
//! - **Polling**: [`Poller`] fetches pending work for this node and backs off
//!   exponentially while the queue is unreachable
//! - **Claiming / reporting**: [`HttpQueueClient`] talks to the queue API
//! - **Execution**: [`ScriptComposer`] runs pre-script, main command and
//!   post-script through a [`CommandRunner`]
//! - **Reboots**: [`RebootScheduler`] hands delayed restarts to the OS
//!
//! Jobs from one poll run strictly one after another, in the order the queue
//! returned them.

pub mod client;
pub mod composer;
pub mod executor;
pub mod poller;
pub mod reboot;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use client::{ClaimOutcome, HttpQueueClient, JobQueueApi};
pub use composer::{Composition, ScriptComposer};
pub use executor::{CommandResult, CommandRunner, ExecOutcome, ExecRequest, ProcessExecutor};
pub use poller::{AgentExit, PollState, Poller};
pub use reboot::{RebootScheduler, SystemReboot};

use crate::config::AgentConfig;
use crate::error::Result;

/// Process exit code asking the service manager to start the agent again.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Build a poller wired to the real queue, processes and reboot command.
pub fn build_poller(config: AgentConfig) -> Result<Poller> {
    let queue = HttpQueueClient::new(&config.queue_url, &config.node_id, config.request_timeout)?;
    let composer = ScriptComposer::new(Arc::new(ProcessExecutor::new()));
    Ok(Poller::new(
        config,
        Arc::new(queue),
        composer,
        Arc::new(SystemReboot::new()),
    ))
}

/// Run the agent until shutdown or a restart request.
pub async fn run_agent(config: AgentConfig, shutdown: CancellationToken) -> Result<AgentExit> {
    tracing::info!(
        node_id = %config.node_id,
        queue = %config.queue_url,
        strict_claims = config.strict_claims,
        "Starting fleet agent"
    );
    let mut poller = build_poller(config)?;
    Ok(poller.run(shutdown).await)
}
