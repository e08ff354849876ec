//! Task distribution: handing queued tasks to something that runs them.
//!
//! [`Distributor`] is the seam between the scheduler and actual execution.
//! [`InProcessDistributor`] runs registered actions on the local runtime and
//! reports the full instance lifecycle into an [`InMemoryServer`];
//! [`DetachedDistributor`] is the no-op used when remote workers drain the
//! server queue on their own.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::gateway::{InMemoryServer, TaskErrorKind};
use crate::resources::{ClusterLimits, TaskResources};
use crate::status::TaskStatus;
use crate::workflow::{TaskId, WorkflowRunId};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    Message(String),
    #[error("no action registered for template '{name}'")]
    UnknownTemplate { name: String },
    #[error("distributor is shutting down")]
    ShuttingDown,
}

pub type DispatchResult<T> = Result<T, DispatchError>;

// ============================================================================
// Invocations and Outcomes
// ============================================================================

/// Why one task attempt failed.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn worker(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Worker,
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Resource,
            message: message.into(),
        }
    }
}

/// Everything an action receives about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub run_id: WorkflowRunId,
    pub task_id: TaskId,
    pub template_name: String,
    pub args: BTreeMap<String, String>,
    pub attempt: u32,
    pub resources: TaskResources,
}

/// Executable body of a template, registered by name.
pub type TaskAction =
    Arc<dyn Fn(TaskInvocation) -> BoxFuture<'static, Result<(), TaskFailure>> + Send + Sync>;

/// Wrap an async closure as a registrable [`TaskAction`].
pub fn boxed_action<F, Fut>(action: F) -> TaskAction
where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), TaskFailure>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(action(invocation)))
}

/// Opaque identity of one submitted instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionHandle(pub Uuid);

/// One task the scheduler wants executed.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub invocation: TaskInvocation,
}

/// Per-request submit result, in request order.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub task_id: TaskId,
    pub result: DispatchResult<SubmissionHandle>,
}

/// Live-instance census.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceProbe {
    pub in_flight: usize,
    pub completed: usize,
}

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait Distributor: Send + Sync {
    /// Hand queued tasks to workers. Returns one outcome per request, in
    /// request order. Individual failures do not abort the batch.
    async fn submit(&self, requests: Vec<SubmitRequest>) -> Vec<SubmitOutcome>;

    /// Order every live instance to stop and acknowledge its kill. Submits
    /// after this call are rejected. Idempotent.
    async fn kill_all(&self) -> DispatchResult<()>;

    fn probe(&self) -> InstanceProbe;

    /// Resource ceilings the execution back-end enforces.
    fn limits(&self) -> ClusterLimits;
}

// ============================================================================
// Detached (remote workers)
// ============================================================================

/// Distributor for deployments where remote workers drain the server queue
/// themselves. Submit succeeds without doing anything.
#[derive(Default)]
pub struct DetachedDistributor {
    limits: ClusterLimits,
}

impl DetachedDistributor {
    pub fn new(limits: ClusterLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Distributor for DetachedDistributor {
    async fn submit(&self, requests: Vec<SubmitRequest>) -> Vec<SubmitOutcome> {
        requests
            .into_iter()
            .map(|request| SubmitOutcome {
                task_id: request.invocation.task_id,
                result: Ok(SubmissionHandle(Uuid::new_v4())),
            })
            .collect()
    }

    async fn kill_all(&self) -> DispatchResult<()> {
        Ok(())
    }

    fn probe(&self) -> InstanceProbe {
        InstanceProbe::default()
    }

    fn limits(&self) -> ClusterLimits {
        self.limits
    }
}

// ============================================================================
// In-Process
// ============================================================================

/// Runs actions as local tokio tasks, bounded by a permit pool, and reports
/// each instance's lifecycle into the backing [`InMemoryServer`].
pub struct InProcessDistributor {
    server: InMemoryServer,
    actions: Mutex<HashMap<String, TaskAction>>,
    instances: Arc<Mutex<HashMap<SubmissionHandle, (TaskId, JoinHandle<()>)>>>,
    permits: Arc<Semaphore>,
    completed: Arc<AtomicUsize>,
    killed: AtomicBool,
    limits: ClusterLimits,
}

impl InProcessDistributor {
    pub fn new(server: InMemoryServer, parallelism: usize, limits: ClusterLimits) -> Self {
        Self {
            server,
            actions: Mutex::new(HashMap::new()),
            instances: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            completed: Arc::new(AtomicUsize::new(0)),
            killed: AtomicBool::new(false),
            limits,
        }
    }

    pub fn register_action(&self, template_name: impl Into<String>, action: TaskAction) {
        self.actions()
            .insert(template_name.into(), action);
    }

    fn actions(&self) -> MutexGuard<'_, HashMap<String, TaskAction>> {
        self.actions.lock().expect("action registry poisoned")
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<SubmissionHandle, (TaskId, JoinHandle<()>)>> {
        self.instances.lock().expect("instance registry poisoned")
    }

    fn spawn_instance(&self, action: TaskAction, invocation: TaskInvocation) -> SubmissionHandle {
        let handle = SubmissionHandle(Uuid::new_v4());
        let server = self.server.clone();
        let permits = Arc::clone(&self.permits);
        let instances = Arc::clone(&self.instances);
        let completed = Arc::clone(&self.completed);
        let task_id = invocation.task_id;

        let join = tokio::spawn(async move {
            server.record_remote_status(task_id, TaskStatus::Instantiating, None);
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            server.record_remote_status(task_id, TaskStatus::Launched, None);
            server.record_remote_status(task_id, TaskStatus::Running, None);
            match action(invocation).await {
                Ok(()) => {
                    server.record_remote_status(task_id, TaskStatus::Done, None);
                }
                Err(failure) => {
                    server.record_remote_status(
                        task_id,
                        TaskStatus::ErrorRecoverable,
                        Some(failure.kind),
                    );
                }
            }
            completed.fetch_add(1, Ordering::SeqCst);
            instances
                .lock()
                .expect("instance registry poisoned")
                .remove(&handle);
        });

        self.instances().insert(handle, (task_id, join));
        handle
    }
}

#[async_trait]
impl Distributor for InProcessDistributor {
    async fn submit(&self, requests: Vec<SubmitRequest>) -> Vec<SubmitOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let task_id = request.invocation.task_id;
            if self.killed.load(Ordering::SeqCst) {
                self.server.record_remote_status(
                    task_id,
                    TaskStatus::ErrorRecoverable,
                    Some(TaskErrorKind::Lost),
                );
                outcomes.push(SubmitOutcome {
                    task_id,
                    result: Err(DispatchError::ShuttingDown),
                });
                continue;
            }
            let action = self
                .actions()
                .get(&request.invocation.template_name)
                .cloned();
            let Some(action) = action else {
                // A queue-accepted attempt that cannot spawn is a worker
                // failure; report it so the retry machinery sees it.
                self.server.record_remote_status(
                    task_id,
                    TaskStatus::ErrorRecoverable,
                    Some(TaskErrorKind::Worker),
                );
                outcomes.push(SubmitOutcome {
                    task_id,
                    result: Err(DispatchError::UnknownTemplate {
                        name: request.invocation.template_name.clone(),
                    }),
                });
                continue;
            };
            let handle = self.spawn_instance(action, request.invocation);
            outcomes.push(SubmitOutcome {
                task_id,
                result: Ok(handle),
            });
        }
        outcomes
    }

    async fn kill_all(&self) -> DispatchResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        let drained: Vec<(TaskId, JoinHandle<()>)> =
            self.instances().drain().map(|(_, entry)| entry).collect();
        for (task_id, join) in drained {
            join.abort();
            self.server.record_kill_ack(task_id);
        }
        Ok(())
    }

    fn probe(&self) -> InstanceProbe {
        let in_flight = self
            .instances()
            .values()
            .filter(|(_, join)| !join.is_finished())
            .count();
        InstanceProbe {
            in_flight,
            completed: self.completed.load(Ordering::SeqCst),
        }
    }

    fn limits(&self) -> ClusterLimits {
        self.limits
    }
}

// ============================================================================
// Tests
// ============================================================================
