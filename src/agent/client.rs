use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{JobResult, PendingJob, PendingJobsResponse, NODE_ID_HEADER};

/// What the queue said about a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This agent now owns the attempt
    Claimed,
    /// The queue refused: already claimed, not ours, or gone
    Rejected { status: u16, reason: String },
    /// The queue could not be asked
    Unavailable(String),
}

/// The agent's view of the job queue.
#[async_trait]
pub trait JobQueueApi: Send + Sync {
    /// Claimable instances for `node_id`, oldest first.
    async fn pending_jobs(&self, node_id: &str) -> Result<Vec<PendingJob>>;

    /// Mark an instance as running for this node.
    async fn claim(&self, instance_id: Uuid) -> ClaimOutcome;

    /// Post the outcome of one attempt.
    async fn report_result(&self, result: &JobResult) -> Result<()>;
}

/// HTTP client for the queue API.
#[derive(Clone)]
pub struct HttpQueueClient {
    http: reqwest::Client,
    base_url: Url,
    node_id: String,
}

impl HttpQueueClient {
    pub fn new(base_url: &str, node_id: &str, request_timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            NODE_ID_HEADER,
            reqwest::header::HeaderValue::from_str(node_id)
                .map_err(|e| FleetError::InvalidRequest(format!("invalid node id: {}", e)))?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;
        let base_url = Url::parse(base_url).map_err(|e| {
            FleetError::InvalidRequest(format!("invalid queue url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(FleetError::InvalidRequest(format!(
                "queue url {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            http,
            base_url,
            node_id: node_id.to_string(),
        })
    }

    /// Base URL extended with percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                FleetError::InvalidRequest(format!(
                    "queue url {} cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FleetError::UnexpectedStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl JobQueueApi for HttpQueueClient {
    async fn pending_jobs(&self, node_id: &str) -> Result<Vec<PendingJob>> {
        let response = self
            .http
            .get(self.url(&["jobs", "pending", node_id])?)
            .send()
            .await?;
        let body: PendingJobsResponse = error_for_status(response).await?.json().await?;
        tracing::debug!(node_id, count = body.count, "Fetched pending jobs");
        Ok(body.jobs)
    }

    async fn claim(&self, instance_id: Uuid) -> ClaimOutcome {
        let id = instance_id.to_string();
        let url = match self.url(&["jobs", "instances", &id, "start"]) {
            Ok(url) => url,
            Err(e) => return ClaimOutcome::Unavailable(e.to_string()),
        };
        let response = match self.http.post(url).send().await {
            Ok(response) => response,
            Err(e) => return ClaimOutcome::Unavailable(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return ClaimOutcome::Claimed;
        }
        let reason = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                ClaimOutcome::Rejected {
                    status: status.as_u16(),
                    reason,
                }
            }
            _ => ClaimOutcome::Unavailable(format!("{}: {}", status, reason)),
        }
    }

    async fn report_result(&self, result: &JobResult) -> Result<()> {
        let response = self
            .http
            .post(self.url(&["jobs", "instances", &result.instance_id.to_string(), "result"])?)
            .json(result)
            .send()
            .await?;
        error_for_status(response).await?;
        tracing::debug!(
            node_id = %self.node_id,
            instance_id = %result.instance_id,
            "Result accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client =
            HttpQueueClient::new("http://queue:8080/", "node-1", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url(&["jobs", "pending", "node-1"]).unwrap().as_str(),
            "http://queue:8080/jobs/pending/node-1"
        );

        let prefixed =
            HttpQueueClient::new("http://queue:8080/fleet", "node-1", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            prefixed.url(&["jobs"]).unwrap().as_str(),
            "http://queue:8080/fleet/jobs"
        );
    }

    #[test]
    fn node_id_is_percent_encoded_in_path() {
        let client =
            HttpQueueClient::new("http://queue:8080", "node-1", Duration::from_secs(5)).unwrap();
        let url = client.url(&["jobs", "pending", "rack 4/slot#2?x"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://queue:8080/jobs/pending/rack%204%2Fslot%232%3Fx"
        );
        assert_eq!(url.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn rejects_invalid_queue_url() {
        assert!(HttpQueueClient::new("not a url", "node-1", Duration::from_secs(5)).is_err());
        assert!(HttpQueueClient::new("mailto:ops@example.com", "n", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn rejects_unrepresentable_node_id() {
        assert!(HttpQueueClient::new("http://q", "bad\nid", Duration::from_secs(5)).is_err());
    }
}
