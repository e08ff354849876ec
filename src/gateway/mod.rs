//! Server gateway: the typed boundary to the remote state authority.
//!
//! Every server operation the orchestration core performs goes through
//! [`ServerGateway`]. Two implementations ship here: [`HttpServerGateway`]
//! for a real deployment and [`InMemoryServer`] for tests and local runs.

mod http;
mod memory;

pub use http::HttpServerGateway;
pub use memory::InMemoryServer;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::TaskResources;
use crate::status::{RunStatus, TaskStatus};
use crate::workflow::{TaskId, TemplateId, WorkflowId, WorkflowRunId};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("{operation} outcome is ambiguous; reconcile before retrying")]
    Ambiguous { operation: &'static str },
    #[error("run claim rejected: {reason}")]
    ClaimRejected { reason: String },
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: String,
    },
}

impl GatewayError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Message(_)
            | Self::Serialization(_)
            | Self::Ambiguous { .. }
            | Self::ClaimRejected { .. }
            | Self::RetriesExhausted { .. } => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded exponential backoff for gateway calls.
///
/// `delay = base * multiplier^(attempt - 1)`, capped at `max_delay_ms`, with
/// up to 25% additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 || self.base_delay_ms == 0 {
            return 0;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let delay = (self.base_delay_ms as f64 * factor) as u64;
        delay.min(self.max_delay_ms)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// One task row carried in a fresh bind request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindTask {
    pub task_id: TaskId,
    pub template: TemplateId,
    pub template_name: String,
    pub max_attempts: u32,
    pub resources: TaskResources,
}

/// Claim (or resume-claim) a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindRequest {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub run_id: WorkflowRunId,
    pub resume: bool,
    pub tasks: Vec<BindTask>,
    pub edges: Vec<(TaskId, TaskId)>,
}

/// Successful bind outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindGrant {
    pub run_id: WorkflowRunId,
    /// Cursor the first delta pull should start from.
    pub cursor: u64,
}

/// Why an attempt ended in `ErrorRecoverable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The instance exceeded a resource limit (memory, runtime).
    Resource,
    /// The worker reported a failure or died mid-task.
    Worker,
    /// The instance stopped heartbeating and was reaped.
    Lost,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Worker => "worker",
            Self::Lost => "lost",
        }
    }
}

/// One task status change in the server's ordered log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub sequence: u64,
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Total attempts the server has recorded for the task.
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<TaskErrorKind>,
    pub recorded_at: DateTime<Utc>,
}

/// Server instruction carried on every delta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDirective {
    #[default]
    Proceed,
    ColdResume,
    HotResume,
    Terminate,
}

/// Page of status updates strictly after the request cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusDeltaPage {
    pub updates: Vec<TaskStatusUpdate>,
    pub next_cursor: u64,
    #[serde(default)]
    pub directive: RunDirective,
    /// Kill-self instances the server is still waiting on.
    #[serde(default)]
    pub pending_forced_kills: u32,
}

/// Scope of a concurrency limit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "template")]
pub enum ConcurrencyScope {
    Workflow,
    Template(TemplateId),
}

/// One task in a queue-batch request, with the resources to launch it under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub resources: TaskResources,
}

/// Batch enqueue request. The token makes retries of the same batch
/// idempotent on the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueBatchRequest {
    pub token: Uuid,
    pub entries: Vec<QueueEntry>,
}

/// Per-task queue outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueResult {
    pub task_id: TaskId,
    pub accepted: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// Liveness report pushed by the heartbeat service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub recorded_at: DateTime<Utc>,
    pub run_status: RunStatus,
    pub tasks_in_flight: usize,
}

/// Answer to an is-resumable probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumableStatus {
    pub resumable: bool,
    /// Instances from the previous run still pending kill-self cleanup.
    pub pending_forced_kills: u32,
}

/// One task row in a run snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotTask {
    pub task_id: TaskId,
    pub template: TemplateId,
    pub status: TaskStatus,
    pub attempts: u32,
}

/// Authoritative task/edge/status snapshot for rebuild paths.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub workflow_id: WorkflowId,
    pub cursor: u64,
    pub tasks: Vec<SnapshotTask>,
    pub edges: Vec<(TaskId, TaskId)>,
}

// ============================================================================
// Trait
// ============================================================================

/// Typed client for the workflow server.
///
/// Calls must enforce their own timeouts. Idempotent reads may be retried
/// internally; mutations are retried only when the request carries an
/// idempotency token. A mutation whose outcome cannot be established
/// surfaces [`GatewayError::Ambiguous`] rather than guessing.
#[async_trait]
pub trait ServerGateway: Send + Sync {
    /// Claim a workflow run. Rejection (another active run holds the claim)
    /// is [`GatewayError::ClaimRejected`] and is fatal to the attempt.
    async fn bind_workflow_run(&self, request: &BindRequest) -> GatewayResult<BindGrant>;

    /// Status updates strictly after `cursor`, in log order.
    async fn fetch_status_deltas(
        &self,
        run_id: WorkflowRunId,
        cursor: u64,
    ) -> GatewayResult<StatusDeltaPage>;

    /// Record a concurrency limit change server-side. `None` lifts the limit.
    async fn push_concurrency_limit(
        &self,
        run_id: WorkflowRunId,
        scope: ConcurrencyScope,
        limit: Option<usize>,
    ) -> GatewayResult<()>;

    async fn heartbeat(&self, run_id: WorkflowRunId, report: &HeartbeatReport)
    -> GatewayResult<()>;

    /// Enqueue a batch of fringe tasks for dispatch.
    async fn queue_batch(
        &self,
        run_id: WorkflowRunId,
        request: &QueueBatchRequest,
    ) -> GatewayResult<Vec<QueueResult>>;

    async fn is_resumable(&self, workflow_id: WorkflowId) -> GatewayResult<ResumableStatus>;

    /// Full task/edge/status snapshot of the workflow's most recent run.
    async fn fetch_run_snapshot(&self, workflow_id: WorkflowId) -> GatewayResult<RunSnapshot>;
}

// ============================================================================
// Tests
// ============================================================================
