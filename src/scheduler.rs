//! Turns the dispatch fringe into queue batches and hands them to workers.
//!
//! Batches are cut in fringe order under two caps: a per-template running
//! limit and the workflow-wide limit. Tasks are committed optimistically
//! before the queue call; entries the server rejects are released back to
//! the fringe, and a batch whose outcome is unknown is parked until the
//! server confirms or refutes it.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::distributor::{Distributor, SubmissionHandle, SubmitRequest, TaskInvocation};
use crate::gateway::{GatewayError, QueueBatchRequest, QueueEntry, ServerGateway};
use crate::resources::TaskResources;
use crate::state::SwarmState;
use crate::workflow::{TaskId, WorkflowRunId};

struct PlannedDispatch {
    task_id: TaskId,
    resources: TaskResources,
    attempt: u32,
}

/// What one dispatch cycle accomplished.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Entries the server accepted for execution.
    pub queued: usize,
    /// Entries the server refused; they went back to the fringe.
    pub rejected: usize,
    pub submitted: Vec<(TaskId, SubmissionHandle)>,
    pub failed_submits: usize,
    /// The whole batch is parked pending server confirmation.
    pub ambiguous: bool,
}

impl DispatchReport {
    pub fn dispatched(&self) -> bool {
        self.queued > 0
    }
}

pub struct Scheduler {
    gateway: Arc<dyn ServerGateway>,
    distributor: Arc<dyn Distributor>,
    run_id: WorkflowRunId,
    max_batch: usize,
}

impl Scheduler {
    pub fn new(
        gateway: Arc<dyn ServerGateway>,
        distributor: Arc<dyn Distributor>,
        run_id: WorkflowRunId,
        max_batch: usize,
    ) -> Self {
        Self {
            gateway,
            distributor,
            run_id,
            max_batch: max_batch.max(1),
        }
    }

    /// Cut the next batch from the fringe. Tasks whose template is at its
    /// running limit are passed over without losing their place; the scan
    /// stops once the workflow-wide limit is reached.
    fn plan_batch(&self, state: &mut SwarmState) -> Vec<PlannedDispatch> {
        let mut planned = Vec::new();
        let mut passed_over = Vec::new();
        while planned.len() < self.max_batch {
            if let Some(cap) = state.workflow_limit()
                && state.slots_in_use() >= cap
            {
                break;
            }
            let Some(task_id) = state.pop_ready() else {
                break;
            };
            let Some(template) = state.workflow().task(task_id).map(|spec| spec.template) else {
                continue;
            };
            if !state.template_available(template) {
                passed_over.push(task_id);
                continue;
            }
            let Some((resources, attempt)) = state.commit_dispatch(task_id) else {
                continue;
            };
            planned.push(PlannedDispatch {
                task_id,
                resources,
                attempt,
            });
        }
        state.restore_ready_front(passed_over);
        planned
    }

    /// Run one dispatch cycle: plan a batch, queue it with the server, and
    /// hand the accepted entries to the distributor.
    pub async fn dispatch(&self, state: &mut SwarmState) -> DispatchReport {
        let planned = self.plan_batch(state);
        if planned.is_empty() {
            return DispatchReport::default();
        }

        let request = QueueBatchRequest {
            token: Uuid::new_v4(),
            entries: planned
                .iter()
                .map(|plan| QueueEntry {
                    task_id: plan.task_id,
                    resources: plan.resources.clone(),
                })
                .collect(),
        };
        let results = match self.gateway.queue_batch(self.run_id, &request).await {
            Ok(results) => results,
            Err(
                err @ (GatewayError::Ambiguous { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::RetriesExhausted { .. }),
            ) => {
                // The server may have applied the batch. Park everything
                // until a delta or snapshot settles the question.
                warn!(error = %err, tasks = planned.len(), "queue batch outcome unknown, parking");
                for plan in &planned {
                    state.park_dispatch(plan.task_id);
                }
                return DispatchReport {
                    ambiguous: true,
                    ..DispatchReport::default()
                };
            }
            Err(err) => {
                warn!(error = %err, tasks = planned.len(), "queue batch failed");
                metrics::counter!("belay_dispatch_errors_total").increment(1);
                for plan in &planned {
                    state.release_dispatch(plan.task_id);
                }
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        let mut accepted = Vec::new();
        for (plan, result) in planned.iter().zip(&results) {
            if result.accepted {
                report.queued += 1;
                if let Some(invocation) = self.invocation_for(state, plan) {
                    accepted.push(SubmitRequest { invocation });
                }
            } else {
                debug!(
                    task_id = %plan.task_id,
                    note = result.note.as_deref().unwrap_or(""),
                    "queue entry rejected, returning task to the fringe"
                );
                report.rejected += 1;
                state.release_dispatch(plan.task_id);
            }
        }

        for outcome in self.distributor.submit(accepted).await {
            match outcome.result {
                Ok(handle) => report.submitted.push((outcome.task_id, handle)),
                Err(err) => {
                    warn!(task_id = %outcome.task_id, error = %err, "submit failed");
                    metrics::counter!("belay_dispatch_errors_total").increment(1);
                    report.failed_submits += 1;
                }
            }
        }
        report
    }

    fn invocation_for(&self, state: &SwarmState, plan: &PlannedDispatch) -> Option<TaskInvocation> {
        let workflow = state.workflow();
        let spec = workflow.task(plan.task_id)?;
        let template_name = workflow.template(spec.template)?.name.clone();
        Some(TaskInvocation {
            run_id: self.run_id,
            task_id: plan.task_id,
            template_name,
            args: spec.args.clone(),
            attempt: plan.attempt,
            resources: plan.resources.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
