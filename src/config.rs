use std::net::SocketAddr;
use std::time::Duration;

/// Agent-side polling and execution settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity this agent polls and reports as
    pub node_id: String,
    /// Base URL of the job queue (e.g., "http://queue.local:8080")
    pub queue_url: String,
    /// Sleep between healthy poll cycles
    pub poll_interval: Duration,
    /// First backoff step after a transport error; doubles per consecutive error
    pub backoff_base: Duration,
    /// Ceiling for the backoff delay
    pub backoff_max: Duration,
    /// Per-request timeout for calls to the queue
    pub request_timeout: Duration,
    /// Skip jobs whose claim is rejected by the queue. When false, a rejected
    /// claim is logged and the job still runs.
    pub strict_claims: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: "localhost".to_string(),
            queue_url: "http://127.0.0.1:8080".to_string(),
            poll_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(30),
            strict_claims: true,
        }
    }
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, queue_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            queue_url: queue_url.into(),
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_strict_claims(mut self, strict: bool) -> Self {
        self.strict_claims = strict;
        self
    }
}

/// Queue server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on stored job instances
    pub max_instances: usize,
    /// How often running instances are checked for lost results
    pub sweep_interval: Duration,
    /// Extra time past an instance's own timeout before it counts as lost
    pub result_grace: Duration,
    /// Nodes not seen for this long are reported as stale
    pub stale_after: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            max_instances: 100_000,
            sweep_interval: Duration::from_secs(30),
            result_grace: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(10 * 60),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
