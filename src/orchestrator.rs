//! The run loop that drives one workflow run end to end.
//!
//! One orchestrator owns one run: it binds (fresh or resumed), then cycles
//! sync -> settle -> dispatch on a fixed interval while a heartbeat task
//! keeps the server's liveness record fresh on its own timer. The loop
//! never busy-spins: a productive dispatch earns at most one immediate
//! follow-up sync before pacing resumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::builder::{BoundSwarm, BuildResult, SwarmBuilder};
use crate::config::SwarmConfig;
use crate::distributor::Distributor;
use crate::gateway::{ConcurrencyScope, RunDirective, ServerGateway};
use crate::heartbeat::{HeartbeatMonitor, spawn_heartbeat};
use crate::scheduler::Scheduler;
use crate::status::{ExitReason, HaltKind, RunStatus, TaskStatus};
use crate::sync::{SyncPolicy, Synchronizer};
use crate::workflow::{TaskId, Workflow, WorkflowId, WorkflowRunId};

// ============================================================================
// Control Surface
// ============================================================================

#[derive(Debug)]
pub enum ControlMessage {
    SetLimit {
        scope: ConcurrencyScope,
        limit: Option<usize>,
    },
}

/// Remote control for a running orchestrator. Dropping the handle does not
/// stop the run.
pub struct OrchestratorHandle {
    shutdown_tx: watch::Sender<bool>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl OrchestratorHandle {
    /// Ask the run loop to wind down at its next cycle.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Change a concurrency limit mid-run. Applied locally only after the
    /// server acknowledges the new value.
    pub fn set_limit(&self, scope: ConcurrencyScope, limit: Option<usize>) {
        let _ = self.control_tx.send(ControlMessage::SetLimit { scope, limit });
    }
}

// ============================================================================
// Result
// ============================================================================

/// Immutable summary of a finished run.
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    pub run_id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub reason: ExitReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sync_cycles: u64,
    pub tasks_dispatched: u64,
    pub dispatch_failures: u64,
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    pub status_counts: BTreeMap<&'static str, usize>,
    pub failed_tasks: Vec<TaskId>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct WorkflowRunOrchestrator {
    gateway: Arc<dyn ServerGateway>,
    distributor: Arc<dyn Distributor>,
    config: SwarmConfig,
    shutdown_rx: watch::Receiver<bool>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl WorkflowRunOrchestrator {
    pub fn new(
        gateway: Arc<dyn ServerGateway>,
        distributor: Arc<dyn Distributor>,
        config: SwarmConfig,
    ) -> (Self, OrchestratorHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                gateway,
                distributor,
                config,
                shutdown_rx,
                control_rx,
            },
            OrchestratorHandle {
                shutdown_tx,
                control_tx,
            },
        )
    }

    /// Bind a fresh run and drive it to an exit.
    pub async fn run(self, workflow: Arc<Workflow>) -> BuildResult<OrchestratorResult> {
        let bound = SwarmBuilder::new(self.gateway.clone())
            .bind_fresh(workflow)
            .await?;
        Ok(self.execute(bound).await)
    }

    /// Resume a halted run from the server snapshot and drive it to an exit.
    pub async fn resume(self, workflow: Arc<Workflow>) -> BuildResult<OrchestratorResult> {
        let bound = SwarmBuilder::new(self.gateway.clone())
            .force_cleanup(self.config.force_cleanup)
            .bind_resume(workflow)
            .await?;
        Ok(self.execute(bound).await)
    }

    async fn execute(mut self, bound: BoundSwarm) -> OrchestratorResult {
        let BoundSwarm {
            run_id,
            cursor,
            mut state,
        } = bound;
        let workflow_id = state.workflow().id();
        let workflow_name = state.workflow().name().to_string();
        state.set_workflow_limit(self.config.max_concurrently_running);

        let mut sync = Synchronizer::new(
            self.gateway.clone(),
            run_id,
            workflow_id,
            cursor,
            SyncPolicy {
                sync_timeout: self.config.sync_timeout,
                max_failures: self.config.max_sync_failures,
                refetch_threshold: self.config.ambiguous_refetch_threshold,
            },
        );
        let scheduler = Scheduler::new(
            self.gateway.clone(),
            self.distributor.clone(),
            run_id,
            self.config.dispatch_batch,
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());
        let monitor = HeartbeatMonitor::new(self.config.heartbeat_tolerance);
        monitor.set_run_status(RunStatus::Running);
        let heartbeat_handle = spawn_heartbeat(
            self.gateway.clone(),
            run_id,
            monitor.clone(),
            self.config.heartbeat_interval,
            self.config.request_timeout,
            stop.clone(),
            stop_notify.clone(),
        );

        let started_at = Utc::now();
        let deadline = self
            .config
            .workflow_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut sync_cycles: u64 = 0;
        let mut tasks_dispatched: u64 = 0;
        let mut dispatch_failures: u64 = 0;
        let mut halt_kind: Option<HaltKind> = None;
        let mut extra_sync_used = false;
        let mut shutdown_open = true;

        info!(
            run_id = %run_id,
            workflow = %workflow_name,
            tasks = state.task_count(),
            "run loop starting"
        );

        let reason = loop {
            if *self.shutdown_rx.borrow() {
                info!("run loop exiting: shutdown requested");
                break ExitReason::OperatorShutdown;
            }
            if !monitor.is_healthy() {
                error!(
                    misses = monitor.misses(),
                    "run loop exiting: heartbeat unhealthy"
                );
                break ExitReason::HeartbeatUnhealthy;
            }
            if let Some(at) = deadline
                && tokio::time::Instant::now() >= at
            {
                warn!("run loop exiting: workflow timeout expired");
                break ExitReason::TimedOut;
            }

            while let Ok(ControlMessage::SetLimit { scope, limit }) = self.control_rx.try_recv() {
                sync.queue_limit_change(scope, limit);
            }
            sync.push_limits(&mut state).await;

            let synced = match sync.pull_and_apply(&mut state).await {
                Ok(outcome) => {
                    sync_cycles += 1;
                    monitor.set_tasks_in_flight(state.slots_in_use());
                    match outcome.directive {
                        RunDirective::Terminate => {
                            info!("run loop exiting: run terminated by the server");
                            break ExitReason::ServerTerminate;
                        }
                        RunDirective::ColdResume | RunDirective::HotResume => {
                            let kind = if outcome.directive == RunDirective::ColdResume {
                                HaltKind::ColdResume
                            } else {
                                HaltKind::HotResume
                            };
                            if halt_kind.is_none() {
                                warn!(kind = %kind, "forced halt ordered, killing local instances");
                                if let Err(err) = self.distributor.kill_all().await {
                                    warn!(error = %err, "kill on forced halt failed");
                                }
                                halt_kind = Some(kind);
                            }
                            if outcome.pending_forced_kills == 0 {
                                info!(kind = %kind, "run loop exiting: forced halt complete");
                                break ExitReason::ForcedHalt(kind);
                            }
                            debug!(
                                pending = outcome.pending_forced_kills,
                                "waiting for forced kills to drain"
                            );
                        }
                        RunDirective::Proceed => {}
                    }
                    true
                }
                Err(err) => {
                    if sync.failure_budget_exhausted() {
                        error!(
                            error = %err,
                            failures = sync.failures(),
                            "run loop exiting: sync failure budget exhausted"
                        );
                        break ExitReason::SyncFailures;
                    }
                    debug!(error = %err, "sync cycle failed, retrying after the interval");
                    false
                }
            };

            // The scheduler only ever sees state a completed pull validated
            // this cycle; a halted run only drains kills. Neither settles
            // nor dispatches here.
            if synced && halt_kind.is_none() {
                if state.is_settled() {
                    if state.has_failures() {
                        warn!(
                            failed = state.failed_count(),
                            blocked = state.blocked_count(),
                            "run loop exiting: drained with fatal failures"
                        );
                        break ExitReason::TaskFailures;
                    }
                    info!(done = state.done_count(), "run loop exiting: all tasks done");
                    break ExitReason::Completed;
                }
                if self.config.fail_fast && state.has_failures() {
                    warn!(
                        failed = state.failed_count(),
                        "run loop exiting: fail-fast on fatal failure"
                    );
                    break ExitReason::TaskFailures;
                }

                let report = scheduler.dispatch(&mut state).await;
                tasks_dispatched += report.queued as u64;
                dispatch_failures += report.failed_submits as u64;
                monitor.set_tasks_in_flight(state.slots_in_use());
                if report.dispatched() && !extra_sync_used {
                    // One prompt follow-up sync after a quiet period; pacing
                    // still bounds the steady-state rate.
                    extra_sync_used = true;
                    continue;
                }
                if !report.dispatched() {
                    extra_sync_used = false;
                }
            }

            tokio::select! {
                changed = self.shutdown_rx.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    }
                }
                Some(ControlMessage::SetLimit { scope, limit }) = self.control_rx.recv() => {
                    sync.queue_limit_change(scope, limit);
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {}
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
        };

        info!(
            reason = %reason,
            cycles = sync_cycles,
            dispatched = tasks_dispatched,
            "run loop stopping"
        );
        if !state.is_settled()
            && let Err(err) = self.distributor.kill_all().await
        {
            warn!(error = %err, "failed to kill local instances during teardown");
        }
        stop.store(true, Ordering::SeqCst);
        stop_notify.notify_waiters();
        let _ = heartbeat_handle.await;

        let status = reason.run_status();
        monitor.set_run_status(status);
        monitor.set_tasks_in_flight(0);
        // Final terminal heartbeat releases the server-side claim promptly;
        // on failure the claim lapses when the liveness record expires.
        match tokio::time::timeout(
            self.config.request_timeout,
            self.gateway.heartbeat(run_id, &monitor.report()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "final heartbeat failed"),
            Err(_) => warn!("final heartbeat timed out"),
        }

        let result = OrchestratorResult {
            run_id,
            workflow_id,
            workflow_name,
            status,
            reason,
            started_at,
            finished_at: Utc::now(),
            sync_cycles,
            tasks_dispatched,
            dispatch_failures,
            statuses: state.statuses(),
            status_counts: state.status_counts(),
            failed_tasks: state.failed_tasks(),
        };
        info!(
            run_id = %result.run_id,
            status = %result.status,
            reason = %result.reason,
            "workflow run finished"
        );
        result
    }
}
