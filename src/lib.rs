//! Belay - workflow-run orchestration core: swarm state, batched dispatch,
//! and reconciliation against a remote state authority.

pub mod builder;
pub mod config;
pub mod distributor;
pub mod gateway;
pub mod heartbeat;
pub mod observability;
pub mod orchestrator;
pub mod resources;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod sync;
pub mod workflow;

pub use builder::{BoundSwarm, BuildError, BuildResult, SwarmBuilder};
pub use config::SwarmConfig;
pub use distributor::{
    DetachedDistributor, DispatchError, Distributor, InProcessDistributor, SubmissionHandle,
    SubmitOutcome, SubmitRequest, TaskAction, TaskFailure, TaskInvocation, boxed_action,
};
pub use gateway::{
    ConcurrencyScope, GatewayError, HttpServerGateway, InMemoryServer, RetryPolicy, RunDirective,
    ServerGateway, TaskErrorKind,
};
pub use heartbeat::{HeartbeatMonitor, spawn_heartbeat};
pub use observability::init_tracing;
pub use orchestrator::{
    ControlMessage, OrchestratorHandle, OrchestratorResult, WorkflowRunOrchestrator,
};
pub use resources::{ClusterLimits, ResourceScalingPolicy, TaskResources};
pub use scheduler::{DispatchReport, Scheduler};
pub use state::{ApplyDisposition, RetryDecision, SwarmState};
pub use status::{ExitReason, HaltKind, InstanceStatus, RunStatus, TaskStatus};
pub use sync::{SyncError, SyncOutcome, SyncPolicy, Synchronizer};
pub use workflow::{
    TaskId, TaskSpec, TemplateId, TemplateSpec, Workflow, WorkflowError, WorkflowId, WorkflowRunId,
};
