use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::agent::{run_agent, AgentExit, RESTART_EXIT_CODE};
use fleet_dispatch::config::{AgentConfig, ServerConfig};
use fleet_dispatch::protocol::{
    CommandSpec, CommandType, CreateJobRequest, CreateJobResponse, JobMode, RegisterNodeRequest,
    TargetType,
};
use fleet_dispatch::server::QueueServer;
use fleet_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch")]
#[command(version)]
#[command(about = "Dispatch jobs to a fleet of managed nodes and run them on the agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the central job queue
    Server(ServerArgs),

    /// Run the agent polling loop on a managed node
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node management commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },
}

// =============================================================================
// Server / Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Maximum number of stored job instances
    #[arg(long, default_value = "100000")]
    max_instances: usize,

    /// Seconds between maintenance sweeps
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Seconds past a job's timeout before a running attempt counts as lost
    #[arg(long, default_value = "300")]
    result_grace_secs: u64,

    /// Seconds without a poll before a node is reported stale
    #[arg(long, default_value = "600")]
    stale_after_secs: u64,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node id to poll as (defaults to the machine hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Job queue base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    queue_url: String,

    /// Seconds between polls while the queue is healthy
    #[arg(long, default_value = "30")]
    poll_interval_secs: u64,

    /// First backoff step in seconds after a failed poll
    #[arg(long, default_value = "60")]
    backoff_base_secs: u64,

    /// Backoff ceiling in seconds
    #[arg(long, default_value = "900")]
    backoff_max_secs: u64,

    /// Timeout in seconds for each request to the queue
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Run jobs even when the queue rejects their claim
    #[arg(long)]
    lenient_claims: bool,
}

// =============================================================================
// Client Arguments (shared by job and node commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Job queue base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CommandTypeArg {
    Script,
    Command,
    Powershell,
    Msi,
    RestartAgent,
}

impl From<CommandTypeArg> for CommandType {
    fn from(arg: CommandTypeArg) -> Self {
        match arg {
            CommandTypeArg::Script => CommandType::Script,
            CommandTypeArg::Command => CommandType::Command,
            CommandTypeArg::Powershell => CommandType::Powershell,
            CommandTypeArg::Msi => CommandType::Msi,
            CommandTypeArg::RestartAgent => CommandType::RestartAgent,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    All,
    Group,
    Node,
}

impl From<TargetArg> for TargetType {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::All => TargetType::All,
            TargetArg::Group => TargetType::Group,
            TargetArg::Node => TargetType::Node,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Required,
    Available,
    Uninstall,
}

impl From<ModeArg> for JobMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Required => JobMode::Required,
            ModeArg::Available => JobMode::Available,
            ModeArg::Uninstall => JobMode::Uninstall,
        }
    }
}

// =============================================================================
// Job / Node Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job to a node, a group or the whole fleet
    Submit {
        /// Job name shown to operators
        name: String,

        /// Kind of command
        #[arg(long = "type", value_enum, default_value = "command")]
        command_type: CommandTypeArg,

        /// Command payload as JSON, e.g. '{"command":"ipconfig /all"}'
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Script run before the main command
        #[arg(long)]
        pre_script: Option<String>,

        /// Script run after a successful main command
        #[arg(long)]
        post_script: Option<String>,

        /// Timeout in seconds for the main command
        #[arg(long, default_value = "3600")]
        timeout: u64,

        /// Attempts before the instance is marked failed
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Restart the node after success
        #[arg(long)]
        reboot: bool,

        /// Seconds between success and restart
        #[arg(long, default_value = "60")]
        reboot_delay: u64,

        /// Target kind
        #[arg(long, value_enum, default_value = "all")]
        target: TargetArg,

        /// Group or node id (required unless --target all)
        #[arg(long)]
        target_id: Option<String>,

        /// Deployment mode
        #[arg(long, value_enum, default_value = "required")]
        mode: ModeArg,
    },
    /// List all jobs with instance counts
    List,
    /// Show a job and its instances
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel all unclaimed instances of a job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List registered nodes
    List,
    /// Register a node and set its groups
    Register {
        /// Node id
        node_id: String,

        /// Hostname to record
        #[arg(long)]
        hostname: Option<String>,

        /// Group membership (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn default_node_id() -> String {
    match hostname::get() {
        Ok(name) => name
            .into_string()
            .unwrap_or_else(|_| "invalid-hostname".to_string()),
        Err(_) => "unknown-host".to_string(),
    }
}

async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(body);
    Err(format!("{}: {}", status, message).into())
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

// =============================================================================
// Server / Agent Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let config = ServerConfig {
        listen_addr,
        max_instances: args.max_instances,
        sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
        result_grace: Duration::from_secs(args.result_grace_secs),
        stale_after: Duration::from_secs(args.stale_after_secs),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_instances = config.max_instances,
        "Starting fleet-dispatch queue"
    );

    let shutdown = install_shutdown_handler();
    QueueServer::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_agent_command(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let node_id = args.node_id.unwrap_or_else(default_node_id);
    let config = AgentConfig {
        node_id,
        queue_url: args.queue_url,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        backoff_base: Duration::from_secs(args.backoff_base_secs),
        backoff_max: Duration::from_secs(args.backoff_max_secs),
        request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
        strict_claims: !args.lenient_claims,
    };

    let shutdown = install_shutdown_handler();
    match run_agent(config, shutdown).await? {
        AgentExit::Shutdown => Ok(()),
        AgentExit::RestartRequested => {
            tracing::info!(exit_code = RESTART_EXIT_CODE, "Exiting for restart");
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobListItem {
    id: String,
    name: String,
    target: Value,
    command: Value,
    #[serde(default)]
    instance_counts: std::collections::BTreeMap<String, usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceItem {
    id: String,
    node_id: String,
    status: String,
    attempt: u32,
    max_attempts: u32,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeItem {
    id: String,
    hostname: Option<String>,
    groups: Vec<String>,
    last_seen: Option<String>,
    stale: bool,
}

fn describe_target(target: &Value) -> String {
    match (target["type"].as_str(), target["id"].as_str()) {
        (Some(kind), Some(id)) => format!("{}:{}", kind, id),
        (Some(kind), None) => kind.to_string(),
        _ => "-".to_string(),
    }
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    request: CreateJobRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .post(format!("{}/jobs", client.addr))
        .json(&request)
        .send()
        .await?;
    let created: CreateJobResponse = check_response(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => print_json(&created)?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:    {}", created.job_id);
            println!("Instances: {}", created.instance_count);
        }
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http.get(format!("{}/jobs", client.addr)).send().await?;
    let jobs: Value = check_response(response).await?.json().await?;

    if let OutputFormat::Json = client.output {
        return print_json(&jobs);
    }

    let jobs: Vec<JobListItem> = serde_json::from_value(jobs)?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!(
        "{:<38} {:<20} {:<14} {:<12} STATUS",
        "JOB ID", "NAME", "TARGET", "TYPE"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        let counts = job
            .instance_counts
            .iter()
            .map(|(status, n)| format!("{}={}", status, n))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<38} {:<20} {:<14} {:<12} {}",
            job.id,
            truncate(&job.name, 20),
            truncate(&describe_target(&job.target), 14),
            job.command["commandType"].as_str().unwrap_or("-"),
            counts
        );
    }
    println!();
    println!("{} jobs", jobs.len());
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/jobs/{}", client.addr, job_id))
        .send()
        .await?;
    let detail: Value = check_response(response).await?.json().await?;

    if let OutputFormat::Json = client.output {
        return print_json(&detail);
    }

    println!("Job ID:  {}", detail["id"].as_str().unwrap_or("-"));
    println!("Name:    {}", detail["name"].as_str().unwrap_or("-"));
    println!("Target:  {}", describe_target(&detail["target"]));
    println!(
        "Type:    {}",
        detail["command"]["commandType"].as_str().unwrap_or("-")
    );
    println!();

    let instances: Vec<InstanceItem> = serde_json::from_value(detail["instances"].clone())?;
    println!(
        "{:<38} {:<20} {:<10} {:<8} EXIT",
        "INSTANCE ID", "NODE", "STATUS", "ATTEMPT"
    );
    println!("{}", "-".repeat(86));
    for instance in &instances {
        let exit = instance
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<20} {:<10} {:<8} {}",
            instance.id,
            truncate(&instance.node_id, 20),
            instance.status,
            format!("{}/{}", instance.attempt, instance.max_attempts),
            exit
        );
        for (label, text) in [("stdout", &instance.stdout), ("stderr", &instance.stderr)] {
            if let Some(text) = text.as_deref().filter(|t| !t.trim().is_empty()) {
                println!("  {}:", label);
                for line in text.lines() {
                    println!("    {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .post(format!("{}/jobs/{}/cancel", client.addr, job_id))
        .send()
        .await?;
    let body: Value = check_response(response).await?.json().await?;
    match client.output {
        OutputFormat::Json => print_json(&body)?,
        OutputFormat::Table => {
            println!("Cancelled {} instances", body["cancelled"].as_u64().unwrap_or(0));
        }
    }
    Ok(())
}

async fn handle_node_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http.get(format!("{}/nodes", client.addr)).send().await?;
    let nodes: Value = check_response(response).await?.json().await?;

    if let OutputFormat::Json = client.output {
        return print_json(&nodes);
    }

    let nodes: Vec<NodeItem> = serde_json::from_value(nodes)?;
    if nodes.is_empty() {
        println!("No nodes registered.");
        return Ok(());
    }
    println!(
        "{:<24} {:<20} {:<26} {:<7} GROUPS",
        "NODE", "HOSTNAME", "LAST SEEN", "STATE"
    );
    println!("{}", "-".repeat(90));
    for node in &nodes {
        let state = if node.stale { "[-]" } else { "[+]" };
        println!(
            "{:<24} {:<20} {:<26} {:<7} {}",
            truncate(&node.id, 24),
            truncate(node.hostname.as_deref().unwrap_or("-"), 20),
            node.last_seen.as_deref().unwrap_or("never"),
            state,
            node.groups.join(",")
        );
    }
    Ok(())
}

async fn handle_node_register(
    http: &reqwest::Client,
    client: &ClientArgs,
    node_id: String,
    request: RegisterNodeRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .put(format!("{}/nodes/{}", client.addr, node_id))
        .json(&request)
        .send()
        .await?;
    check_response(response).await?;
    println!("Node {} registered", node_id);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Agent(agent_args) => {
            run_agent_command(agent_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit {
                    name,
                    command_type,
                    payload,
                    pre_script,
                    post_script,
                    timeout,
                    max_attempts,
                    reboot,
                    reboot_delay,
                    target,
                    target_id,
                    mode,
                } => {
                    let payload: Value = serde_json::from_str(&payload)
                        .map_err(|e| format!("--payload is not valid JSON: {}", e))?;
                    let request = CreateJobRequest {
                        name,
                        description: None,
                        command: CommandSpec {
                            pre_script,
                            post_script,
                            timeout_seconds: timeout,
                            max_attempts,
                            requires_reboot: reboot,
                            reboot_delay_seconds: reboot_delay,
                            ..CommandSpec::new(command_type.into(), payload)
                        },
                        target_type: target.into(),
                        target_id,
                        mode: mode.into(),
                        scheduled_start: None,
                        scheduled_end: None,
                    };
                    handle_job_submit(&http, &client, request).await?;
                }
                JobCommands::List => handle_job_list(&http, &client).await?,
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&http, &client, job_id).await?;
                }
            }
        }
        Commands::Node { client, command } => {
            let http = reqwest::Client::new();
            match command {
                NodeCommands::List => handle_node_list(&http, &client).await?,
                NodeCommands::Register {
                    node_id,
                    hostname,
                    groups,
                } => {
                    let request = RegisterNodeRequest { hostname, groups };
                    handle_node_register(&http, &client, node_id, request).await?;
                }
            }
        }
    }

    Ok(())
}
