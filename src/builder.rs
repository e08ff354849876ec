//! Binding a workflow to a run: fresh claims and halted-run resumes.
//!
//! Resume rebuilds local state from the server's snapshot instead of
//! trusting anything cached client-side. The snapshot's cursor becomes the
//! sync cursor, so deltas recorded between snapshot and bind are replayed
//! and deduplicated rather than skipped.

use std::sync::Arc;

use tracing::{debug, info};

use crate::gateway::{BindRequest, BindTask, GatewayError, RunSnapshot, ServerGateway};
use crate::state::SwarmState;
use crate::workflow::{Workflow, WorkflowError, WorkflowRunId};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Gateway(GatewayError),
    #[error("run claim rejected: {reason}")]
    ClaimRejected { reason: String },
    #[error("{pending} instance(s) from the previous run still await forced cleanup")]
    PendingCleanup { pending: u32 },
    #[error("workflow has no halted run to resume")]
    NotResumable,
    #[error("server snapshot does not match the workflow: {detail}")]
    SnapshotMismatch { detail: String },
}

impl From<GatewayError> for BuildError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ClaimRejected { reason } => Self::ClaimRejected { reason },
            other => Self::Gateway(other),
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

// ============================================================================
// Builder
// ============================================================================

/// A claimed run with its rebuilt state and starting sync cursor.
#[derive(Debug)]
pub struct BoundSwarm {
    pub run_id: WorkflowRunId,
    pub cursor: u64,
    pub state: SwarmState,
}

pub struct SwarmBuilder {
    gateway: Arc<dyn ServerGateway>,
    force_cleanup: bool,
}

impl SwarmBuilder {
    pub fn new(gateway: Arc<dyn ServerGateway>) -> Self {
        Self {
            gateway,
            force_cleanup: false,
        }
    }

    /// Resume even while instances from the previous run are still being
    /// reaped. Their slots were already released when the run halted.
    pub fn force_cleanup(mut self, force: bool) -> Self {
        self.force_cleanup = force;
        self
    }

    /// Validate the workflow and claim a brand-new run for it.
    pub async fn bind_fresh(&self, workflow: Arc<Workflow>) -> BuildResult<BoundSwarm> {
        workflow.validate()?;
        let run_id = WorkflowRunId::new();
        let request = self.bind_request(&workflow, run_id, false)?;
        let grant = self.gateway.bind_workflow_run(&request).await?;
        info!(
            run_id = %grant.run_id,
            workflow = workflow.name(),
            tasks = workflow.task_count(),
            "workflow run bound"
        );
        Ok(BoundSwarm {
            run_id: grant.run_id,
            cursor: grant.cursor,
            state: SwarmState::from_workflow(workflow),
        })
    }

    /// Claim a halted run and rebuild state from the server snapshot.
    /// Carried-over recoverable errors are settled into retries (or fatal
    /// failures) before the first sync cycle.
    pub async fn bind_resume(&self, workflow: Arc<Workflow>) -> BuildResult<BoundSwarm> {
        workflow.validate()?;
        let probe = self.gateway.is_resumable(workflow.id()).await?;
        if probe.pending_forced_kills > 0 && !self.force_cleanup {
            return Err(BuildError::PendingCleanup {
                pending: probe.pending_forced_kills,
            });
        }
        if !probe.resumable {
            return Err(BuildError::NotResumable);
        }
        let snapshot = self.gateway.fetch_run_snapshot(workflow.id()).await?;
        verify_snapshot(&workflow, &snapshot)?;

        let run_id = WorkflowRunId::new();
        let request = self.bind_request(&workflow, run_id, true)?;
        let grant = self.gateway.bind_workflow_run(&request).await?;

        let mut state = SwarmState::from_snapshot(workflow, &snapshot);
        for task_id in state.unresolved_errors() {
            debug!(task_id = %task_id, "settling error carried over from halted run");
            state.resolve_recoverable(task_id, None);
        }
        info!(
            run_id = %grant.run_id,
            cursor = snapshot.cursor,
            done = state.done_count(),
            "workflow run resumed"
        );
        Ok(BoundSwarm {
            run_id: grant.run_id,
            cursor: snapshot.cursor,
            state,
        })
    }

    fn bind_request(
        &self,
        workflow: &Workflow,
        run_id: WorkflowRunId,
        resume: bool,
    ) -> BuildResult<BindRequest> {
        let mut tasks = Vec::with_capacity(workflow.task_count());
        for spec in workflow.tasks() {
            let template_name = workflow
                .template(spec.template)
                .map(|template| template.name.clone())
                .unwrap_or_default();
            tasks.push(BindTask {
                task_id: spec.id,
                template: spec.template,
                template_name,
                max_attempts: workflow.task_max_attempts(spec.id)?,
                resources: workflow.task_resources(spec.id)?,
            });
        }
        Ok(BindRequest {
            workflow_id: workflow.id(),
            workflow_name: workflow.name().to_string(),
            run_id,
            resume,
            tasks,
            edges: workflow.edges().to_vec(),
        })
    }
}

/// The snapshot must describe exactly the workflow being resumed; a drifted
/// definition would corrupt dependency bookkeeping.
fn verify_snapshot(workflow: &Workflow, snapshot: &RunSnapshot) -> BuildResult<()> {
    let mismatch = |detail: String| BuildError::SnapshotMismatch { detail };
    if snapshot.workflow_id != workflow.id() {
        return Err(mismatch(format!(
            "snapshot belongs to workflow {}",
            snapshot.workflow_id
        )));
    }
    if snapshot.tasks.len() != workflow.task_count() {
        return Err(mismatch(format!(
            "snapshot has {} task(s), workflow has {}",
            snapshot.tasks.len(),
            workflow.task_count()
        )));
    }
    for row in &snapshot.tasks {
        let Some(spec) = workflow.task(row.task_id) else {
            return Err(mismatch(format!(
                "snapshot task {} is not in the workflow",
                row.task_id
            )));
        };
        if spec.template != row.template {
            return Err(mismatch(format!(
                "task {} moved between templates",
                row.task_id
            )));
        }
    }
    let mut snapshot_edges = snapshot.edges.clone();
    snapshot_edges.sort_unstable();
    let mut workflow_edges = workflow.edges().to_vec();
    workflow_edges.sort_unstable();
    if snapshot_edges != workflow_edges {
        return Err(mismatch("dependency edges differ".to_string()));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
