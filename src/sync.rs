//! Pulls ordered status deltas from the server and applies them to run state.
//!
//! The synchronizer owns the delta cursor. Every page is validated for
//! strictly increasing sequences before anything is applied; a malformed
//! page fails the cycle without touching state. It also resolves recoverable
//! errors into retry decisions, settles parked dispatches, and pushes
//! pending concurrency-limit changes ahead of local enforcement.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::gateway::{ConcurrencyScope, GatewayError, RunDirective, ServerGateway};
use crate::state::{ApplyDisposition, RetryDecision, SwarmState};
use crate::status::TaskStatus;
use crate::workflow::{WorkflowId, WorkflowRunId};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("delta page out of order: sequence {got} not after {expected_after}")]
    OutOfOrder { expected_after: u64, got: u64 },
}

pub type SyncResult<T> = Result<T, SyncError>;

// ============================================================================
// Policy & Outcome
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    /// Per-pull deadline.
    pub sync_timeout: Duration,
    /// Consecutive pull failures tolerated before the run gives up.
    pub max_failures: u32,
    /// Sync cycles a dispatch may stay parked before a snapshot refetch
    /// settles it.
    pub refetch_threshold: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            max_failures: 5,
            refetch_threshold: 3,
        }
    }
}

/// What one sync cycle observed and did.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub applied: usize,
    pub duplicates: usize,
    /// Regressive or unknown-task updates dropped.
    pub dropped: usize,
    /// Tasks re-armed for another attempt this cycle.
    pub requeued: usize,
    /// Tasks that ran out of attempts this cycle.
    pub exhausted: usize,
    pub directive: RunDirective,
    pub pending_forced_kills: u32,
    /// A snapshot refetch settled parked dispatches this cycle.
    pub reconciled: bool,
}

// ============================================================================
// Synchronizer
// ============================================================================

pub struct Synchronizer {
    gateway: Arc<dyn ServerGateway>,
    run_id: WorkflowRunId,
    workflow_id: WorkflowId,
    cursor: u64,
    policy: SyncPolicy,
    consecutive_failures: u32,
    /// Sync cycles the current parked set has survived unconfirmed.
    ambiguous_cycles: u32,
    pending_limits: VecDeque<(ConcurrencyScope, Option<usize>)>,
}

impl Synchronizer {
    pub fn new(
        gateway: Arc<dyn ServerGateway>,
        run_id: WorkflowRunId,
        workflow_id: WorkflowId,
        cursor: u64,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            gateway,
            run_id,
            workflow_id,
            cursor,
            policy,
            consecutive_failures: 0,
            ambiguous_cycles: 0,
            pending_limits: VecDeque::new(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failure_budget_exhausted(&self) -> bool {
        self.consecutive_failures >= self.policy.max_failures
    }

    /// Record a limit change to push on the next cycle. Changes apply
    /// locally only after the server acknowledges them.
    pub fn queue_limit_change(&mut self, scope: ConcurrencyScope, limit: Option<usize>) {
        self.pending_limits.push_back((scope, limit));
    }

    pub fn pending_limit_count(&self) -> usize {
        self.pending_limits.len()
    }

    /// Push queued limit changes to the server, applying each locally once
    /// acknowledged. Stops at the first failure; the rest stay queued.
    pub async fn push_limits(&mut self, state: &mut SwarmState) -> usize {
        let mut pushed = 0;
        while let Some((scope, limit)) = self.pending_limits.front().copied() {
            match self
                .gateway
                .push_concurrency_limit(self.run_id, scope, limit)
                .await
            {
                Ok(()) => {
                    match scope {
                        ConcurrencyScope::Workflow => state.set_workflow_limit(limit),
                        ConcurrencyScope::Template(template) => {
                            state.set_template_limit(template, limit)
                        }
                    }
                    info!(?scope, ?limit, "concurrency limit updated");
                    self.pending_limits.pop_front();
                    pushed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "limit push failed, keeping it queued");
                    break;
                }
            }
        }
        pushed
    }

    /// One sync cycle: pull deltas after the cursor, validate ordering,
    /// apply them, resolve recoverable errors, and settle parked work.
    pub async fn pull_and_apply(&mut self, state: &mut SwarmState) -> SyncResult<SyncOutcome> {
        let page = match tokio::time::timeout(
            self.policy.sync_timeout,
            self.gateway.fetch_status_deltas(self.run_id, self.cursor),
        )
        .await
        {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => return Err(self.note_failure(err.into())),
            Err(_) => {
                return Err(self.note_failure(
                    GatewayError::Timeout {
                        operation: "fetch_status_deltas",
                    }
                    .into(),
                ));
            }
        };

        // Validate the whole page before applying any of it.
        let mut last_sequence = self.cursor;
        for update in &page.updates {
            if update.sequence <= last_sequence {
                return Err(self.note_failure(SyncError::OutOfOrder {
                    expected_after: last_sequence,
                    got: update.sequence,
                }));
            }
            last_sequence = update.sequence;
        }

        let mut outcome = SyncOutcome {
            directive: page.directive,
            pending_forced_kills: page.pending_forced_kills,
            ..SyncOutcome::default()
        };
        for update in &page.updates {
            match state.apply_status_update(update) {
                ApplyDisposition::Applied => {
                    outcome.applied += 1;
                    if update.status == TaskStatus::ErrorRecoverable {
                        match state.resolve_recoverable(update.task_id, update.error) {
                            Some(RetryDecision::Requeued { .. }) => outcome.requeued += 1,
                            Some(RetryDecision::Exhausted) => outcome.exhausted += 1,
                            None => {}
                        }
                    }
                }
                ApplyDisposition::Duplicate => outcome.duplicates += 1,
                ApplyDisposition::Regressive | ApplyDisposition::Unknown => outcome.dropped += 1,
            }
        }
        self.cursor = page.next_cursor;
        self.consecutive_failures = 0;

        self.settle_parked(state, &mut outcome).await;

        debug!(
            cursor = self.cursor,
            applied = outcome.applied,
            requeued = outcome.requeued,
            directive = ?outcome.directive,
            "sync cycle complete"
        );
        Ok(outcome)
    }

    /// Count cycles the parked set survives; once it crosses the threshold,
    /// fetch an authoritative snapshot and settle every parked dispatch.
    async fn settle_parked(&mut self, state: &mut SwarmState, outcome: &mut SyncOutcome) {
        if state.parked_count() == 0 {
            self.ambiguous_cycles = 0;
            return;
        }
        self.ambiguous_cycles += 1;
        if self.ambiguous_cycles < self.policy.refetch_threshold {
            return;
        }
        match self.gateway.fetch_run_snapshot(self.workflow_id).await {
            Ok(snapshot) => {
                let (confirmed, released) = state.reconcile_parked(&snapshot);
                info!(confirmed, released, "parked dispatches settled via snapshot");
                self.ambiguous_cycles = 0;
                outcome.reconciled = true;
            }
            Err(err) => {
                warn!(error = %err, "snapshot refetch failed, parked tasks stay parked");
            }
        }
    }

    fn note_failure(&mut self, err: SyncError) -> SyncError {
        self.consecutive_failures += 1;
        metrics::counter!("belay_sync_failures_total").increment(1);
        warn!(
            error = %err,
            consecutive = self.consecutive_failures,
            "sync cycle failed"
        );
        err
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::DetachedDistributor;
    use crate::gateway::{
        BindGrant, BindRequest, BindTask, GatewayResult, HeartbeatReport, InMemoryServer,
        QueueBatchRequest, QueueResult, ResumableStatus, RunSnapshot, ServerGateway,
        StatusDeltaPage, TaskErrorKind, TaskStatusUpdate,
    };
    use crate::resources::{ClusterLimits, TaskResources};
    use crate::scheduler::Scheduler;
    use crate::workflow::{TaskId, TemplateId, TemplateSpec, Workflow};
    use async_trait::async_trait;
    use chrono::Utc;

    fn two_task_workflow(max_attempts: u32) -> Workflow {
        let mut workflow = Workflow::new("sync");
        let template = workflow.add_template(TemplateSpec {
            name: "step".to_string(),
            max_attempts,
            ..TemplateSpec::default()
        });
        workflow.add_task(template, [("n", "0")]).unwrap();
        workflow.add_task(template, [("n", "1")]).unwrap();
        workflow
    }

    async fn bind(server: &InMemoryServer, workflow: &Workflow) -> WorkflowRunId {
        let run_id = WorkflowRunId::new();
        let request = BindRequest {
            workflow_id: workflow.id(),
            workflow_name: workflow.name().to_string(),
            run_id,
            resume: false,
            tasks: workflow
                .tasks()
                .iter()
                .map(|spec| BindTask {
                    task_id: spec.id,
                    template: spec.template,
                    template_name: String::new(),
                    max_attempts: 3,
                    resources: TaskResources::default(),
                })
                .collect(),
            edges: workflow.edges().to_vec(),
        };
        server.bind_workflow_run(&request).await.unwrap();
        run_id
    }

    fn synchronizer(
        server: &InMemoryServer,
        run_id: WorkflowRunId,
        workflow_id: WorkflowId,
    ) -> Synchronizer {
        Synchronizer::new(
            Arc::new(server.clone()),
            run_id,
            workflow_id,
            0,
            SyncPolicy::default(),
        )
    }

    #[tokio::test]
    async fn applies_deltas_and_advances_the_cursor() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        server.record_remote_status(TaskId(0), TaskStatus::Queued, None);
        server.record_remote_status(TaskId(0), TaskStatus::Running, None);
        server.record_remote_status(TaskId(0), TaskStatus::Done, None);

        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(outcome.applied, 3);
        assert_eq!(sync.cursor(), 3);
        assert_eq!(state.status_of(TaskId(0)), Some(TaskStatus::Done));

        // Nothing new on the next pull.
        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(sync.cursor(), 3);
    }

    #[tokio::test]
    async fn recoverable_error_is_resolved_into_a_requeue() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        let scheduler = Scheduler::new(
            Arc::new(server.clone()),
            Arc::new(DetachedDistributor::new(ClusterLimits::unbounded())),
            run_id,
            64,
        );
        scheduler.dispatch(&mut state).await;
        server.record_remote_status(
            TaskId(0),
            TaskStatus::ErrorRecoverable,
            Some(TaskErrorKind::Worker),
        );

        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(outcome.exhausted, 0);
        assert_eq!(
            state.status_of(TaskId(0)),
            Some(TaskStatus::AdjustingResources)
        );
        assert!(state.fringe_snapshot().contains(&TaskId(0)));
    }

    #[tokio::test]
    async fn exhausted_attempts_resolve_into_a_fatal_failure() {
        let workflow = two_task_workflow(1);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        let scheduler = Scheduler::new(
            Arc::new(server.clone()),
            Arc::new(DetachedDistributor::new(ClusterLimits::unbounded())),
            run_id,
            64,
        );
        scheduler.dispatch(&mut state).await;
        server.record_remote_status(
            TaskId(0),
            TaskStatus::ErrorRecoverable,
            Some(TaskErrorKind::Worker),
        );

        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(outcome.exhausted, 1);
        assert_eq!(state.status_of(TaskId(0)), Some(TaskStatus::ErrorFatal));
        assert!(state.has_failures());
    }

    #[tokio::test]
    async fn out_of_order_page_fails_without_applying_anything() {
        struct BrokenGateway;

        #[async_trait]
        impl ServerGateway for BrokenGateway {
            async fn bind_workflow_run(&self, _: &BindRequest) -> GatewayResult<BindGrant> {
                unreachable!()
            }
            async fn fetch_status_deltas(
                &self,
                _: WorkflowRunId,
                _: u64,
            ) -> GatewayResult<StatusDeltaPage> {
                let update = |sequence| TaskStatusUpdate {
                    sequence,
                    task_id: TaskId(0),
                    status: TaskStatus::Done,
                    attempts: 1,
                    error: None,
                    recorded_at: Utc::now(),
                };
                Ok(StatusDeltaPage {
                    updates: vec![update(1), update(1)],
                    next_cursor: 2,
                    directive: RunDirective::Proceed,
                    pending_forced_kills: 0,
                })
            }
            async fn push_concurrency_limit(
                &self,
                _: WorkflowRunId,
                _: ConcurrencyScope,
                _: Option<usize>,
            ) -> GatewayResult<()> {
                unreachable!()
            }
            async fn heartbeat(&self, _: WorkflowRunId, _: &HeartbeatReport) -> GatewayResult<()> {
                unreachable!()
            }
            async fn queue_batch(
                &self,
                _: WorkflowRunId,
                _: &QueueBatchRequest,
            ) -> GatewayResult<Vec<QueueResult>> {
                unreachable!()
            }
            async fn is_resumable(&self, _: WorkflowId) -> GatewayResult<ResumableStatus> {
                unreachable!()
            }
            async fn fetch_run_snapshot(&self, _: WorkflowId) -> GatewayResult<RunSnapshot> {
                unreachable!()
            }
        }

        let workflow = two_task_workflow(3);
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = Synchronizer::new(
            Arc::new(BrokenGateway),
            WorkflowRunId::new(),
            workflow_id,
            0,
            SyncPolicy::default(),
        );

        let err = sync.pull_and_apply(&mut state).await.unwrap_err();
        assert!(matches!(err, SyncError::OutOfOrder { .. }));
        // Nothing applied, cursor unchanged, failure counted.
        assert_eq!(state.status_of(TaskId(0)), Some(TaskStatus::Registering));
        assert_eq!(sync.cursor(), 0);
        assert_eq!(sync.failures(), 1);
    }

    #[tokio::test]
    async fn consecutive_failures_count_and_reset_on_success() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = Synchronizer::new(
            Arc::new(server.clone()),
            run_id,
            workflow_id,
            0,
            SyncPolicy {
                max_failures: 2,
                ..SyncPolicy::default()
            },
        );

        server.fail_next("fetch_status_deltas", 2);
        assert!(sync.pull_and_apply(&mut state).await.is_err());
        assert!(!sync.failure_budget_exhausted());
        assert!(sync.pull_and_apply(&mut state).await.is_err());
        assert!(sync.failure_budget_exhausted());

        sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(sync.failures(), 0);
        assert!(!sync.failure_budget_exhausted());
    }

    #[tokio::test]
    async fn parked_dispatch_reconciles_after_the_threshold() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        let scheduler = Scheduler::new(
            Arc::new(server.clone()),
            Arc::new(DetachedDistributor::new(ClusterLimits::unbounded())),
            run_id,
            64,
        );
        // The response is lost and the server never applied the batch.
        server.ambiguous_next_queue(false);
        let report = scheduler.dispatch(&mut state).await;
        assert!(report.ambiguous);
        assert_eq!(state.parked_count(), 2);

        // Two quiet cycles keep the tasks parked.
        for _ in 0..2 {
            let outcome = sync.pull_and_apply(&mut state).await.unwrap();
            assert!(!outcome.reconciled);
            assert_eq!(state.parked_count(), 2);
        }
        // The third crosses the threshold and the snapshot refutes the
        // dispatch, so the tasks go back to the fringe.
        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert!(outcome.reconciled);
        assert_eq!(state.parked_count(), 0);
        assert_eq!(state.fringe_snapshot().len(), 2);
        assert_eq!(state.status_of(TaskId(0)), Some(TaskStatus::Registering));
    }

    #[tokio::test]
    async fn parked_dispatch_confirms_from_the_delta_stream() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        let scheduler = Scheduler::new(
            Arc::new(server.clone()),
            Arc::new(DetachedDistributor::new(ClusterLimits::unbounded())),
            run_id,
            64,
        );
        // The server applied the batch; only the response was lost.
        server.ambiguous_next_queue(true);
        scheduler.dispatch(&mut state).await;
        assert_eq!(state.parked_count(), 2);

        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert!(!outcome.reconciled);
        assert_eq!(state.parked_count(), 0);
        // Confirmed tasks keep their optimistic Queued status and slots.
        assert_eq!(state.slots_in_use(), 2);
        assert_eq!(outcome.duplicates, 2);
    }

    #[tokio::test]
    async fn limit_changes_apply_only_after_the_server_ack() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        sync.queue_limit_change(ConcurrencyScope::Workflow, Some(5));
        sync.queue_limit_change(ConcurrencyScope::Template(TemplateId(0)), Some(2));

        server.fail_next("push_concurrency_limit", 1);
        assert_eq!(sync.push_limits(&mut state).await, 0);
        assert_eq!(sync.pending_limit_count(), 2);
        assert_eq!(state.workflow_limit(), None);

        assert_eq!(sync.push_limits(&mut state).await, 2);
        assert_eq!(sync.pending_limit_count(), 0);
        assert_eq!(state.workflow_limit(), Some(5));
        assert_eq!(state.template_limit(TemplateId(0)), Some(2));
        assert_eq!(
            server.pushed_limits(),
            vec![
                (ConcurrencyScope::Workflow, Some(5)),
                (ConcurrencyScope::Template(TemplateId(0)), Some(2)),
            ]
        );
    }

    #[tokio::test]
    async fn directive_and_pending_kills_pass_through() {
        let workflow = two_task_workflow(3);
        let server = InMemoryServer::new();
        let run_id = bind(&server, &workflow).await;
        let workflow_id = workflow.id();
        let mut state = SwarmState::from_workflow(Arc::new(workflow));
        let mut sync = synchronizer(&server, run_id, workflow_id);

        server.set_directive(RunDirective::ColdResume);
        server.set_pending_forced_kills(3);

        let outcome = sync.pull_and_apply(&mut state).await.unwrap();
        assert_eq!(outcome.directive, RunDirective::ColdResume);
        assert_eq!(outcome.pending_forced_kills, 3);
    }
}
