//! In-memory workflow server for tests and local runs.
//!
//! Holds the authoritative task-status log the way a real server would:
//! every change appends an ordered [`TaskStatusUpdate`], and delta pulls
//! replay the log from a cursor. Fault and directive injection knobs let
//! tests drive degraded-server behavior through the same gateway calls
//! production code uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    BindGrant, BindRequest, ConcurrencyScope, GatewayError, GatewayResult, HeartbeatReport,
    QueueBatchRequest, QueueResult, ResumableStatus, RunDirective, RunSnapshot, ServerGateway,
    SnapshotTask, StatusDeltaPage, TaskErrorKind, TaskStatusUpdate,
};
use crate::status::TaskStatus;
use crate::workflow::{TaskId, TemplateId, WorkflowId, WorkflowRunId};

#[derive(Clone, Copy)]
struct ServerTask {
    template: TemplateId,
    status: TaskStatus,
    attempts: u32,
}

#[derive(Default)]
struct ServerWorld {
    workflow_id: Option<WorkflowId>,
    run_id: Option<WorkflowRunId>,
    active: bool,
    tasks: HashMap<TaskId, ServerTask>,
    edges: Vec<(TaskId, TaskId)>,
    log: Vec<TaskStatusUpdate>,
    directive: RunDirective,
    pending_forced_kills: u32,
    queue_tokens: HashMap<Uuid, Vec<QueueResult>>,
    heartbeats: Vec<HeartbeatReport>,
    pushed_limits: Vec<(ConcurrencyScope, Option<usize>)>,
    fail_counts: HashMap<&'static str, u32>,
    /// Pending queue-batch ambiguity; the flag says whether the batch is
    /// still applied server-side before the response is "lost".
    ambiguous_queue: Option<bool>,
}

impl ServerWorld {
    fn append(&mut self, task_id: TaskId, status: TaskStatus, error: Option<TaskErrorKind>) {
        let attempts = self.tasks.get(&task_id).map(|t| t.attempts).unwrap_or(0);
        let sequence = self.log.len() as u64 + 1;
        self.log.push(TaskStatusUpdate {
            sequence,
            task_id,
            status,
            attempts,
            error,
            recorded_at: Utc::now(),
        });
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = status;
        }
    }

    fn take_fault(&mut self, operation: &'static str) -> Option<GatewayError> {
        let remaining = self.fail_counts.get_mut(operation)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(GatewayError::Server {
            status: 503,
            message: format!("injected {operation} fault"),
        })
    }

    fn process_queue_batch(&mut self, request: &QueueBatchRequest) -> Vec<QueueResult> {
        let mut results = Vec::with_capacity(request.entries.len());
        for entry in &request.entries {
            let Some(task) = self.tasks.get_mut(&entry.task_id) else {
                results.push(QueueResult {
                    task_id: entry.task_id,
                    accepted: false,
                    note: Some("unknown task".to_string()),
                });
                continue;
            };
            let accepted = matches!(
                task.status,
                TaskStatus::Registering
                    | TaskStatus::AdjustingResources
                    | TaskStatus::ErrorRecoverable
            );
            if accepted {
                task.attempts += 1;
                self.append(entry.task_id, TaskStatus::Queued, None);
                results.push(QueueResult {
                    task_id: entry.task_id,
                    accepted: true,
                    note: None,
                });
            } else {
                let note = if task.status.is_task_terminal() {
                    "task already terminal"
                } else {
                    "task already in flight"
                };
                results.push(QueueResult {
                    task_id: entry.task_id,
                    accepted: false,
                    note: Some(note.to_string()),
                });
            }
        }
        self.queue_tokens.insert(request.token, results.clone());
        results
    }
}

/// Gateway double backed by process-local state, for tests or local runs.
#[derive(Clone, Default)]
pub struct InMemoryServer {
    world: Arc<Mutex<ServerWorld>>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self) -> MutexGuard<'_, ServerWorld> {
        self.world.lock().expect("server world poisoned")
    }

    // ------------------------------------------------------------------
    // Injection knobs
    // ------------------------------------------------------------------

    /// Fail the next `failures` calls of `operation` with a 503.
    pub fn fail_next(&self, operation: &'static str, failures: u32) {
        self.world().fail_counts.insert(operation, failures);
    }

    /// Make the next queue batch return an ambiguous outcome. When
    /// `applied` the server still processes the batch first, as if only
    /// the response was lost.
    pub fn ambiguous_next_queue(&self, applied: bool) {
        self.world().ambiguous_queue = Some(applied);
    }

    pub fn set_directive(&self, directive: RunDirective) {
        self.world().directive = directive;
    }

    pub fn set_pending_forced_kills(&self, pending: u32) {
        self.world().pending_forced_kills = pending;
    }

    /// An instance acknowledged its kill order. In-flight work rolls back
    /// to a recoverable error in the log.
    pub fn record_kill_ack(&self, task_id: TaskId) {
        let mut world = self.world();
        world.pending_forced_kills = world.pending_forced_kills.saturating_sub(1);
        let killable = world
            .tasks
            .get(&task_id)
            .is_some_and(|task| task.status.holds_slot());
        if killable {
            world.append(task_id, TaskStatus::ErrorRecoverable, Some(TaskErrorKind::Lost));
        }
    }

    /// Record a status change as if a worker reported it. Returns false
    /// when the task is unknown.
    pub fn record_remote_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<TaskErrorKind>,
    ) -> bool {
        let mut world = self.world();
        if !world.tasks.contains_key(&task_id) {
            return false;
        }
        world.append(task_id, status, error);
        true
    }

    // ------------------------------------------------------------------
    // Snapshot accessors
    // ------------------------------------------------------------------

    pub fn log(&self) -> Vec<TaskStatusUpdate> {
        self.world().log.clone()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatReport> {
        self.world().heartbeats.clone()
    }

    pub fn pushed_limits(&self) -> Vec<(ConcurrencyScope, Option<usize>)> {
        self.world().pushed_limits.clone()
    }

    pub fn task_row(&self, task_id: TaskId) -> Option<(TaskStatus, u32)> {
        self.world()
            .tasks
            .get(&task_id)
            .map(|task| (task.status, task.attempts))
    }

    pub fn pending_forced_kills(&self) -> u32 {
        self.world().pending_forced_kills
    }

    pub fn is_active(&self) -> bool {
        self.world().active
    }
}

#[async_trait]
impl ServerGateway for InMemoryServer {
    async fn bind_workflow_run(&self, request: &BindRequest) -> GatewayResult<BindGrant> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("bind_workflow_run") {
            return Err(err);
        }
        if world.active {
            return Err(GatewayError::ClaimRejected {
                reason: "another run holds the workflow claim".to_string(),
            });
        }
        if request.resume {
            if world.workflow_id != Some(request.workflow_id) {
                return Err(GatewayError::ClaimRejected {
                    reason: "no prior run to resume".to_string(),
                });
            }
        } else {
            world.workflow_id = Some(request.workflow_id);
            world.tasks = request
                .tasks
                .iter()
                .map(|task| {
                    (
                        task.task_id,
                        ServerTask {
                            template: task.template,
                            status: TaskStatus::Registering,
                            attempts: 0,
                        },
                    )
                })
                .collect();
            world.edges = request.edges.clone();
            world.log.clear();
            world.queue_tokens.clear();
        }
        world.run_id = Some(request.run_id);
        world.active = true;
        Ok(BindGrant {
            run_id: request.run_id,
            cursor: world.log.len() as u64,
        })
    }

    async fn fetch_status_deltas(
        &self,
        run_id: WorkflowRunId,
        cursor: u64,
    ) -> GatewayResult<StatusDeltaPage> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("fetch_status_deltas") {
            return Err(err);
        }
        if world.run_id != Some(run_id) {
            return Err(GatewayError::Server {
                status: 404,
                message: "unknown run".to_string(),
            });
        }
        let start = (cursor as usize).min(world.log.len());
        Ok(StatusDeltaPage {
            updates: world.log[start..].to_vec(),
            next_cursor: world.log.len() as u64,
            directive: world.directive,
            pending_forced_kills: world.pending_forced_kills,
        })
    }

    async fn push_concurrency_limit(
        &self,
        _run_id: WorkflowRunId,
        scope: ConcurrencyScope,
        limit: Option<usize>,
    ) -> GatewayResult<()> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("push_concurrency_limit") {
            return Err(err);
        }
        world.pushed_limits.push((scope, limit));
        Ok(())
    }

    async fn heartbeat(
        &self,
        _run_id: WorkflowRunId,
        report: &HeartbeatReport,
    ) -> GatewayResult<()> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("heartbeat") {
            return Err(err);
        }
        if report.run_status.is_terminal() {
            world.active = false;
        }
        world.heartbeats.push(report.clone());
        Ok(())
    }

    async fn queue_batch(
        &self,
        _run_id: WorkflowRunId,
        request: &QueueBatchRequest,
    ) -> GatewayResult<Vec<QueueResult>> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("queue_batch") {
            return Err(err);
        }
        if let Some(results) = world.queue_tokens.get(&request.token) {
            return Ok(results.clone());
        }
        if let Some(applied) = world.ambiguous_queue.take() {
            if applied {
                world.process_queue_batch(request);
            }
            return Err(GatewayError::Ambiguous {
                operation: "queue_batch",
            });
        }
        Ok(world.process_queue_batch(request))
    }

    async fn is_resumable(&self, workflow_id: WorkflowId) -> GatewayResult<ResumableStatus> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("is_resumable") {
            return Err(err);
        }
        if world.workflow_id != Some(workflow_id) {
            return Err(GatewayError::Server {
                status: 404,
                message: "unknown workflow".to_string(),
            });
        }
        Ok(ResumableStatus {
            resumable: !world.active,
            pending_forced_kills: world.pending_forced_kills,
        })
    }

    async fn fetch_run_snapshot(&self, workflow_id: WorkflowId) -> GatewayResult<RunSnapshot> {
        let mut world = self.world();
        if let Some(err) = world.take_fault("fetch_run_snapshot") {
            return Err(err);
        }
        if world.workflow_id != Some(workflow_id) {
            return Err(GatewayError::Server {
                status: 404,
                message: "unknown workflow".to_string(),
            });
        }
        let mut tasks: Vec<SnapshotTask> = world
            .tasks
            .iter()
            .map(|(task_id, task)| SnapshotTask {
                task_id: *task_id,
                template: task.template,
                status: task.status,
                attempts: task.attempts,
            })
            .collect();
        tasks.sort_by_key(|task| task.task_id);
        Ok(RunSnapshot {
            workflow_id,
            cursor: world.log.len() as u64,
            tasks,
            edges: world.edges.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{BindTask, QueueEntry};
    use crate::resources::TaskResources;
    use crate::status::RunStatus;

    fn bind_request(resume: bool) -> BindRequest {
        BindRequest {
            workflow_id: WorkflowId::new(),
            workflow_name: "ingest".to_string(),
            run_id: WorkflowRunId::new(),
            resume,
            tasks: vec![
                BindTask {
                    task_id: TaskId(0),
                    template: TemplateId(0),
                    template_name: "extract".to_string(),
                    max_attempts: 3,
                    resources: TaskResources::default(),
                },
                BindTask {
                    task_id: TaskId(1),
                    template: TemplateId(0),
                    template_name: "extract".to_string(),
                    max_attempts: 3,
                    resources: TaskResources::default(),
                },
            ],
            edges: vec![(TaskId(0), TaskId(1))],
        }
    }

    fn queue_request(task_ids: &[TaskId]) -> QueueBatchRequest {
        QueueBatchRequest {
            token: Uuid::new_v4(),
            entries: task_ids
                .iter()
                .map(|task_id| QueueEntry {
                    task_id: *task_id,
                    resources: TaskResources::default(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn bind_rejects_second_claim_until_run_goes_terminal() {
        let server = InMemoryServer::new();
        let request = bind_request(false);
        server.bind_workflow_run(&request).await.unwrap();

        let second = bind_request(false);
        let err = server.bind_workflow_run(&second).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClaimRejected { .. }));

        server
            .heartbeat(
                request.run_id,
                &HeartbeatReport {
                    recorded_at: Utc::now(),
                    run_status: RunStatus::Done,
                    tasks_in_flight: 0,
                },
            )
            .await
            .unwrap();
        assert!(server.bind_workflow_run(&second).await.is_ok());
    }

    #[tokio::test]
    async fn deltas_replay_from_cursor_with_increasing_sequences() {
        let server = InMemoryServer::new();
        let request = bind_request(false);
        let grant = server.bind_workflow_run(&request).await.unwrap();
        assert_eq!(grant.cursor, 0);

        server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(0)]))
            .await
            .unwrap();
        server.record_remote_status(TaskId(0), TaskStatus::Running, None);
        server.record_remote_status(TaskId(0), TaskStatus::Done, None);

        let page = server.fetch_status_deltas(grant.run_id, 1).await.unwrap();
        assert_eq!(page.updates.len(), 2);
        assert_eq!(page.updates[0].sequence, 2);
        assert_eq!(page.updates[1].sequence, 3);
        assert_eq!(page.next_cursor, 3);
        assert_eq!(page.updates[1].status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn queue_batch_replays_results_for_a_known_token() {
        let server = InMemoryServer::new();
        let grant = server.bind_workflow_run(&bind_request(false)).await.unwrap();

        let request = queue_request(&[TaskId(0)]);
        let first = server.queue_batch(grant.run_id, &request).await.unwrap();
        let replay = server.queue_batch(grant.run_id, &request).await.unwrap();
        assert!(first[0].accepted);
        assert!(replay[0].accepted);
        // Replay must not double-queue: one Q entry, one attempt.
        assert_eq!(server.log().len(), 1);
        assert_eq!(server.task_row(TaskId(0)), Some((TaskStatus::Queued, 1)));
    }

    #[tokio::test]
    async fn queue_batch_rejects_tasks_not_eligible_for_dispatch() {
        let server = InMemoryServer::new();
        let grant = server.bind_workflow_run(&bind_request(false)).await.unwrap();
        server.record_remote_status(TaskId(0), TaskStatus::Done, None);

        let results = server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(0), TaskId(1)]))
            .await
            .unwrap();
        assert!(!results[0].accepted);
        assert!(results[1].accepted);
    }

    #[tokio::test]
    async fn applied_ambiguity_processes_the_batch_before_failing() {
        let server = InMemoryServer::new();
        let grant = server.bind_workflow_run(&bind_request(false)).await.unwrap();
        server.ambiguous_next_queue(true);

        let err = server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Ambiguous { .. }));
        assert_eq!(server.task_row(TaskId(0)), Some((TaskStatus::Queued, 1)));

        server.ambiguous_next_queue(false);
        let err = server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Ambiguous { .. }));
        assert_eq!(
            server.task_row(TaskId(1)),
            Some((TaskStatus::Registering, 0))
        );
    }

    #[tokio::test]
    async fn fail_next_exhausts_then_recovers() {
        let server = InMemoryServer::new();
        let grant = server.bind_workflow_run(&bind_request(false)).await.unwrap();
        server.fail_next("fetch_status_deltas", 2);

        assert!(server.fetch_status_deltas(grant.run_id, 0).await.is_err());
        assert!(server.fetch_status_deltas(grant.run_id, 0).await.is_err());
        assert!(server.fetch_status_deltas(grant.run_id, 0).await.is_ok());
    }

    #[tokio::test]
    async fn kill_ack_drains_pending_and_logs_a_lost_attempt() {
        let server = InMemoryServer::new();
        let grant = server.bind_workflow_run(&bind_request(false)).await.unwrap();
        server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(0)]))
            .await
            .unwrap();
        server.set_pending_forced_kills(2);

        server.record_kill_ack(TaskId(0));
        assert_eq!(server.pending_forced_kills(), 1);
        let last = server.log().pop().unwrap();
        assert_eq!(last.status, TaskStatus::ErrorRecoverable);
        assert_eq!(last.error, Some(TaskErrorKind::Lost));

        // Task 1 never held a slot, so its ack only drains the counter.
        server.record_kill_ack(TaskId(1));
        assert_eq!(server.pending_forced_kills(), 0);
        assert_eq!(server.log().len(), 2);
    }

    #[tokio::test]
    async fn snapshot_reflects_rows_and_cursor() {
        let server = InMemoryServer::new();
        let request = bind_request(false);
        let grant = server.bind_workflow_run(&request).await.unwrap();
        server
            .queue_batch(grant.run_id, &queue_request(&[TaskId(0)]))
            .await
            .unwrap();
        server.record_remote_status(TaskId(0), TaskStatus::Done, None);

        let snapshot = server.fetch_run_snapshot(request.workflow_id).await.unwrap();
        assert_eq!(snapshot.cursor, 2);
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.tasks[0].status, TaskStatus::Done);
        assert_eq!(snapshot.tasks[0].attempts, 1);
        assert_eq!(snapshot.tasks[1].status, TaskStatus::Registering);
        assert_eq!(snapshot.edges, vec![(TaskId(0), TaskId(1))]);
    }

    #[tokio::test]
    async fn resumable_only_after_the_active_run_ends() {
        let server = InMemoryServer::new();
        let request = bind_request(false);
        server.bind_workflow_run(&request).await.unwrap();

        let probe = server.is_resumable(request.workflow_id).await.unwrap();
        assert!(!probe.resumable);

        server
            .heartbeat(
                request.run_id,
                &HeartbeatReport {
                    recorded_at: Utc::now(),
                    run_status: RunStatus::Halted,
                    tasks_in_flight: 0,
                },
            )
            .await
            .unwrap();
        let probe = server.is_resumable(request.workflow_id).await.unwrap();
        assert!(probe.resumable);
    }
}
