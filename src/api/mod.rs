//! HTTP API of the job queue.
//!
//! Agents use the pending/start/result endpoints and identify themselves with
//! the `X-Node-Id` header. Operators use the rest.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{
    CreateJobRequest, CreateJobResponse, ErrorBody, JobResult, PendingJobsResponse,
    RegisterNodeRequest, NODE_ID_HEADER,
};
use crate::scheduler::{resolve_target, JobDefinition, JobInstance, JobQueue, NodeRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<RwLock<JobQueue>>,
    pub registry: Arc<RwLock<NodeRegistry>>,
    pub stale_after: chrono::Duration,
}

impl ApiState {
    pub fn new(queue: JobQueue, registry: NodeRegistry, stale_after: chrono::Duration) -> Self {
        Self {
            queue: Arc::new(RwLock::new(queue)),
            registry: Arc::new(RwLock::new(registry)),
            stale_after,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: JobDefinition,
    pub instance_counts: BTreeMap<String, usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: JobDefinition,
    pub instances: Vec<JobInstance>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub hostname: Option<String>,
    pub groups: Vec<String>,
    pub last_seen: Option<chrono::DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Serialize)]
struct CancelJobResponse {
    cancelled: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instances: usize,
    nodes: usize,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = match &self {
            FleetError::JobNotFound(_) | FleetError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::NodeMismatch { .. } | FleetError::Forbidden(_) => StatusCode::FORBIDDEN,
            FleetError::InvalidTransition { .. } => StatusCode::CONFLICT,
            FleetError::InvalidTarget(_)
            | FleetError::InvalidRequest(_)
            | FleetError::InvalidPayload(_)
            | FleetError::MissingNodeId
            | FleetError::Json(_) => StatusCode::BAD_REQUEST,
            FleetError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/jobs/{job_id}", get(get_job_handler))
        .route("/jobs/{job_id}/cancel", post(cancel_job_handler))
        .route("/jobs/pending/{node_id}", get(pending_jobs_handler))
        .route("/jobs/instances/{instance_id}", get(get_instance_handler))
        .route("/jobs/instances/{instance_id}/start", post(start_instance_handler))
        .route("/jobs/instances/{instance_id}/result", post(instance_result_handler))
        .route("/jobs/instances/{instance_id}/cancel", post(cancel_instance_handler))
        .route("/nodes", get(list_nodes_handler))
        .route("/nodes/{node_id}", put(register_node_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Job queue API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn caller_node(headers: &HeaderMap) -> Result<String> {
    headers
        .get(NODE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(FleetError::MissingNodeId)
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let instances = state.queue.read().await.len();
    let nodes = state.registry.read().await.len();
    Json(HealthResponse {
        status: "ok",
        instances,
        nodes,
    })
}

async fn create_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>)> {
    let job = JobDefinition::from_request(payload)?;
    let node_ids = {
        let registry = state.registry.read().await;
        resolve_target(&job.target, &registry)?
    };
    let job_id = job.id;
    let instance_ids = state.queue.write().await.create_job(job, node_ids)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            instance_count: instance_ids.len(),
            instance_ids,
        }),
    ))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let queue = state.queue.read().await;
    let jobs: Vec<JobSummary> = queue
        .all_jobs()
        .into_iter()
        .map(|job| JobSummary {
            instance_counts: queue.status_counts(&job.id),
            job: job.clone(),
        })
        .collect();
    Json(jobs)
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetail>> {
    let queue = state.queue.read().await;
    let job = queue
        .get_job(&job_id)
        .ok_or(FleetError::JobNotFound(job_id))?;
    Ok(Json(JobDetail {
        job: job.clone(),
        instances: queue
            .instances_for_job(&job_id)
            .into_iter()
            .cloned()
            .collect(),
    }))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let cancelled = state.queue.write().await.cancel_job(&job_id, Utc::now())?;
    Ok(Json(CancelJobResponse { cancelled }))
}

async fn pending_jobs_handler(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PendingJobsResponse>> {
    if let Ok(caller) = caller_node(&headers) {
        if caller != node_id {
            return Err(FleetError::Forbidden(format!(
                "node {} cannot poll for node {}",
                caller, node_id
            )));
        }
    }

    state.registry.write().await.touch(&node_id);
    let jobs = state
        .queue
        .read()
        .await
        .pending_for_node(&node_id, Utc::now())?;
    Ok(Json(PendingJobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

async fn get_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<JobInstance>> {
    let queue = state.queue.read().await;
    let instance = queue
        .get_instance(&instance_id)
        .ok_or(FleetError::InstanceNotFound(instance_id))?;
    Ok(Json(instance.clone()))
}

async fn start_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<JobInstance>> {
    let node_id = caller_node(&headers)?;
    let mut queue = state.queue.write().await;
    let instance = queue.claim(&instance_id, &node_id, Utc::now())?;
    Ok(Json(instance.clone()))
}

async fn instance_result_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<Uuid>,
    headers: HeaderMap,
    Json(mut result): Json<JobResult>,
) -> Result<Json<JobInstance>> {
    let node_id = caller_node(&headers)?;
    result.instance_id = instance_id;
    let mut queue = state.queue.write().await;
    let instance = queue.record_result(&instance_id, &node_id, &result)?;
    Ok(Json(instance.clone()))
}

async fn cancel_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<JobInstance>> {
    let mut queue = state.queue.write().await;
    let instance = queue.cancel_instance(&instance_id, Utc::now())?;
    Ok(Json(instance.clone()))
}

async fn register_node_handler(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(payload): Json<RegisterNodeRequest>,
) -> Result<StatusCode> {
    if node_id.trim().is_empty() {
        return Err(FleetError::InvalidRequest("node id is empty".to_string()));
    }
    state
        .registry
        .write()
        .await
        .upsert_node(&node_id, payload.hostname, payload.groups);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_nodes_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let now = Utc::now();
    let registry = state.registry.read().await;
    let nodes: Vec<NodeView> = registry
        .all_nodes()
        .into_iter()
        .map(|node| NodeView {
            id: node.id.clone(),
            hostname: node.hostname.clone(),
            groups: node.groups.iter().cloned().collect(),
            last_seen: node.last_seen,
            stale: node.is_stale(now, state.stale_after),
        })
        .collect();
    Json(nodes)
}
