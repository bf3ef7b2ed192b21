use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Instance {instance_id} is bound to node {bound_node}, not {caller}")]
    NodeMismatch {
        instance_id: Uuid,
        bound_node: String,
        caller: String,
    },

    #[error("Instance {instance_id} cannot move from {from} to {to}")]
    InvalidTransition {
        instance_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Invalid job target: {0}")]
    InvalidTarget(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Invalid command payload: {0}")]
    InvalidPayload(String),

    #[error("Job queue is at capacity ({0} instances)")]
    QueueFull(usize),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Missing X-Node-Id header")]
    MissingNodeId,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
