//! HTTP implementation of [`ServerGateway`] over the server's JSON API.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{
    BindGrant, BindRequest, ConcurrencyScope, GatewayError, GatewayResult, HeartbeatReport,
    QueueBatchRequest, QueueResult, ResumableStatus, RetryPolicy, RunSnapshot, ServerGateway,
    StatusDeltaPage,
};
use crate::workflow::{WorkflowId, WorkflowRunId};

/// Typed client for a remote workflow server.
///
/// Idempotent calls retry with backoff per the [`RetryPolicy`]. Bind and
/// heartbeat are single-shot: bind because a lost response leaves the claim
/// in doubt, heartbeat because its own loop is the retry cadence.
pub struct HttpServerGateway {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpServerGateway {
    pub fn new(base_url: &str, request_timeout: Duration) -> GatewayResult<Self> {
        Self::with_retry(base_url, request_timeout, RetryPolicy::default())
    }

    pub fn with_retry(
        base_url: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    metrics::counter!("belay_gateway_retries_total").increment(1);
                    warn!(
                        operation,
                        attempt,
                        error = %err,
                        "gateway call failed, retrying"
                    );
                    tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
                }
                Err(err) if err.is_transient() && attempt > 1 => {
                    return Err(GatewayError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> GatewayResult<T> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        let response = self.client.get(self.endpoint(path)).send().await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(Self::status_error(response).await)
    }

    async fn status_error(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        GatewayError::Server { status, message }
    }
}

#[derive(Serialize)]
struct LimitBody {
    #[serde(flatten)]
    scope: ConcurrencyScope,
    limit: Option<usize>,
}

#[derive(serde::Deserialize)]
struct Empty {}

#[async_trait]
impl ServerGateway for HttpServerGateway {
    async fn bind_workflow_run(&self, request: &BindRequest) -> GatewayResult<BindGrant> {
        let response = self
            .client
            .post(self.endpoint("/api/v1/workflow_run/bind"))
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Ambiguous {
                        operation: "bind_workflow_run",
                    }
                } else {
                    GatewayError::Http(err)
                }
            })?;
        if response.status() == StatusCode::CONFLICT {
            let reason = response.text().await.unwrap_or_default();
            return Err(GatewayError::ClaimRejected { reason });
        }
        Self::parse(response).await
    }

    async fn fetch_status_deltas(
        &self,
        run_id: WorkflowRunId,
        cursor: u64,
    ) -> GatewayResult<StatusDeltaPage> {
        let path = format!("/api/v1/workflow_run/{run_id}/status_deltas?cursor={cursor}");
        self.with_retries("fetch_status_deltas", || self.get_json(&path))
            .await
    }

    async fn push_concurrency_limit(
        &self,
        run_id: WorkflowRunId,
        scope: ConcurrencyScope,
        limit: Option<usize>,
    ) -> GatewayResult<()> {
        let path = format!("/api/v1/workflow_run/{run_id}/concurrency_limit");
        let body = LimitBody { scope, limit };
        self.with_retries("push_concurrency_limit", || async {
            let _: Empty = self.post_json(&path, &body).await?;
            Ok(())
        })
        .await
    }

    async fn heartbeat(
        &self,
        run_id: WorkflowRunId,
        report: &HeartbeatReport,
    ) -> GatewayResult<()> {
        let path = format!("/api/v1/workflow_run/{run_id}/heartbeat");
        let _: Empty = self.post_json(&path, report).await?;
        Ok(())
    }

    async fn queue_batch(
        &self,
        run_id: WorkflowRunId,
        request: &QueueBatchRequest,
    ) -> GatewayResult<Vec<QueueResult>> {
        // Safe to retry: the token makes replays of the same batch idempotent.
        let path = format!("/api/v1/workflow_run/{run_id}/queue_batch");
        self.with_retries("queue_batch", || self.post_json(&path, request))
            .await
    }

    async fn is_resumable(&self, workflow_id: WorkflowId) -> GatewayResult<ResumableStatus> {
        let path = format!("/api/v1/workflow/{workflow_id}/is_resumable");
        self.with_retries("is_resumable", || self.get_json(&path))
            .await
    }

    async fn fetch_run_snapshot(&self, workflow_id: WorkflowId) -> GatewayResult<RunSnapshot> {
        let path = format!("/api/v1/workflow/{workflow_id}/snapshot");
        self.with_retries("fetch_run_snapshot", || self.get_json(&path))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TemplateId;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let gateway =
            HttpServerGateway::new("http://localhost:8000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            gateway.endpoint("/api/v1/workflow_run/bind"),
            "http://localhost:8000/api/v1/workflow_run/bind"
        );
    }

    #[test]
    fn limit_body_wire_shape() {
        let body = LimitBody {
            scope: ConcurrencyScope::Template(TemplateId(2)),
            limit: Some(8),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["scope"], "template");
        assert_eq!(json["template"], 2);
        assert_eq!(json["limit"], 8);

        let body = LimitBody {
            scope: ConcurrencyScope::Workflow,
            limit: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["scope"], "workflow");
        assert!(json["limit"].is_null());
    }
}
