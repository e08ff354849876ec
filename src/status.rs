//! Status vocabulary for tasks, task instances, and workflow runs.
//!
//! Task statuses travel the wire as single-letter codes. The letter set is
//! shared with the server and the distributor fleet, so the mapping here is
//! load-bearing: changing a letter is a protocol change.

use serde::{Deserialize, Serialize};

// ============================================================================
// Task Status
// ============================================================================

/// Lifecycle status of a task within a workflow run.
///
/// The forward pipeline is `G -> Q -> I -> O -> R` followed by one of the
/// attempt outcomes `D`, `E`, or `F`. A recoverable error re-enters the
/// pipeline through `E -> A -> Q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Registered with the run, waiting for upstream dependencies.
    #[serde(rename = "G")]
    Registering,
    /// Accepted into the server-side dispatch queue.
    #[serde(rename = "Q")]
    Queued,
    /// Resource request is being adjusted ahead of a retry.
    #[serde(rename = "A")]
    AdjustingResources,
    /// Distributor is creating a task instance.
    #[serde(rename = "I")]
    Instantiating,
    /// Submitted to the cluster back-end.
    #[serde(rename = "O")]
    Launched,
    /// A worker reported the instance running.
    #[serde(rename = "R")]
    Running,
    /// Finished successfully.
    #[serde(rename = "D")]
    Done,
    /// The attempt failed but the task may retry.
    #[serde(rename = "E")]
    ErrorRecoverable,
    /// Failed permanently; downstream tasks will never run.
    #[serde(rename = "F")]
    ErrorFatal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registering => "G",
            Self::Queued => "Q",
            Self::AdjustingResources => "A",
            Self::Instantiating => "I",
            Self::Launched => "O",
            Self::Running => "R",
            Self::Done => "D",
            Self::ErrorRecoverable => "E",
            Self::ErrorFatal => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "G" => Some(Self::Registering),
            "Q" => Some(Self::Queued),
            "A" => Some(Self::AdjustingResources),
            "I" => Some(Self::Instantiating),
            "O" => Some(Self::Launched),
            "R" => Some(Self::Running),
            "D" => Some(Self::Done),
            "E" => Some(Self::ErrorRecoverable),
            "F" => Some(Self::ErrorFatal),
            _ => None,
        }
    }

    /// Position in the forward pipeline, used for monotonicity checks.
    /// The attempt outcomes share the highest rank so none of them can
    /// overwrite another through the plain forward rule.
    fn pipeline_rank(&self) -> u8 {
        match self {
            Self::Registering => 0,
            Self::Queued | Self::AdjustingResources => 1,
            Self::Instantiating => 2,
            Self::Launched => 3,
            Self::Running => 4,
            Self::Done | Self::ErrorRecoverable | Self::ErrorFatal => 5,
        }
    }

    /// Terminal for the task as a whole. `ErrorRecoverable` is terminal only
    /// for the attempt, never for the task.
    pub fn is_task_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ErrorFatal)
    }

    /// Terminal for the current attempt: the instance has stopped consuming
    /// a concurrency slot.
    pub fn is_attempt_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ErrorRecoverable | Self::ErrorFatal)
    }

    /// Whether a task in this status holds a concurrency slot.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Instantiating | Self::Launched | Self::Running
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Legal moves are the forward pipeline, the retry edges
    /// `E -> A`, `E -> Q`, `A -> Q`, and the forced edge
    /// `any non-terminal -> F` used for exhaustion and orphan cleanup.
    pub fn may_transition(&self, next: TaskStatus) -> bool {
        if *self == next {
            return false;
        }
        if next == Self::ErrorFatal {
            return !self.is_task_terminal();
        }
        match (self, next) {
            (Self::ErrorRecoverable, Self::AdjustingResources)
            | (Self::ErrorRecoverable, Self::Queued)
            | (Self::AdjustingResources, Self::Queued) => true,
            _ => next.pipeline_rank() > self.pipeline_rank(),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Task Instance Status
// ============================================================================

/// Status of a single task instance as observed at the distributor boundary.
///
/// Instances share the task letter codes plus the instance-only `K`
/// (kill-self), which never appears in the task status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Task(TaskStatus),
    KillSelf,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task(status) => status.as_str(),
            Self::KillSelf => "K",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "K" => Some(Self::KillSelf),
            other => TaskStatus::parse(other).map(Self::Task),
        }
    }

    pub fn is_settled(&self) -> bool {
        match self {
            Self::Task(status) => status.is_attempt_terminal(),
            Self::KillSelf => true,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Run Status
// ============================================================================

/// State-machine status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initializing,
    Bound,
    Running,
    Done,
    Error,
    Halted,
    Terminated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Bound => "bound",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Halted => "halted",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "bound" => Some(Self::Bound),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "halted" => Some(Self::Halted),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Halted | Self::Terminated)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Halt Kind & Exit Reason
// ============================================================================

/// Flavor of a server-forced halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltKind {
    ColdResume,
    HotResume,
}

impl HaltKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColdResume => "cold_resume",
            Self::HotResume => "hot_resume",
        }
    }
}

impl std::fmt::Display for HaltKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a run loop exited. Each reason maps to exactly one terminal
/// [`RunStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every task reached `Done`.
    Completed,
    /// The run drained with at least one fatal task failure.
    TaskFailures,
    /// The server forced a halt for a cold or hot resume.
    ForcedHalt(HaltKind),
    /// The server ordered the run terminated.
    ServerTerminate,
    /// Heartbeat delivery failed past the configured tolerance.
    HeartbeatUnhealthy,
    /// Too many consecutive synchronization failures.
    SyncFailures,
    /// The workflow wall-clock timeout expired.
    TimedOut,
    /// The embedding process requested shutdown.
    OperatorShutdown,
}

impl ExitReason {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Done,
            Self::TaskFailures => RunStatus::Error,
            Self::ForcedHalt(_) => RunStatus::Halted,
            Self::ServerTerminate
            | Self::HeartbeatUnhealthy
            | Self::SyncFailures
            | Self::TimedOut
            | Self::OperatorShutdown => RunStatus::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TaskFailures => "task_failures",
            Self::ForcedHalt(HaltKind::ColdResume) => "forced_halt_cold_resume",
            Self::ForcedHalt(HaltKind::HotResume) => "forced_halt_hot_resume",
            Self::ServerTerminate => "server_terminate",
            Self::HeartbeatUnhealthy => "heartbeat_unhealthy",
            Self::SyncFailures => "sync_failures",
            Self::TimedOut => "timed_out",
            Self::OperatorShutdown => "operator_shutdown",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TASK_STATUSES: [TaskStatus; 9] = [
        TaskStatus::Registering,
        TaskStatus::Queued,
        TaskStatus::AdjustingResources,
        TaskStatus::Instantiating,
        TaskStatus::Launched,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::ErrorRecoverable,
        TaskStatus::ErrorFatal,
    ];

    #[test]
    fn task_status_letter_roundtrip() {
        for status in ALL_TASK_STATUSES {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.as_str().len(), 1);
        }
        assert_eq!(TaskStatus::parse("K"), None);
        assert_eq!(TaskStatus::parse("X"), None);
        assert_eq!(TaskStatus::parse("g"), None);
    }

    #[test]
    fn task_status_serde_uses_letter_codes() {
        let json = serde_json::to_string(&TaskStatus::Registering).unwrap();
        assert_eq!(json, "\"G\"");
        let parsed: TaskStatus = serde_json::from_str("\"F\"").unwrap();
        assert_eq!(parsed, TaskStatus::ErrorFatal);
    }

    #[test]
    fn forward_pipeline_is_legal() {
        let pipeline = [
            TaskStatus::Registering,
            TaskStatus::Queued,
            TaskStatus::Instantiating,
            TaskStatus::Launched,
            TaskStatus::Running,
            TaskStatus::Done,
        ];
        for pair in pipeline.windows(2) {
            assert!(pair[0].may_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn retry_edges_are_legal() {
        assert!(TaskStatus::ErrorRecoverable.may_transition(TaskStatus::AdjustingResources));
        assert!(TaskStatus::ErrorRecoverable.may_transition(TaskStatus::Queued));
        assert!(TaskStatus::AdjustingResources.may_transition(TaskStatus::Queued));
    }

    #[test]
    fn regressions_are_rejected() {
        assert!(!TaskStatus::Running.may_transition(TaskStatus::Queued));
        assert!(!TaskStatus::Done.may_transition(TaskStatus::Running));
        assert!(!TaskStatus::Done.may_transition(TaskStatus::ErrorRecoverable));
        assert!(!TaskStatus::Launched.may_transition(TaskStatus::Instantiating));
    }

    #[test]
    fn forced_fatal_spares_terminal_statuses() {
        for status in ALL_TASK_STATUSES {
            let expected = !status.is_task_terminal();
            assert_eq!(status.may_transition(TaskStatus::ErrorFatal), expected);
        }
    }

    #[test]
    fn same_status_is_not_a_transition() {
        for status in ALL_TASK_STATUSES {
            assert!(!status.may_transition(status));
        }
    }

    #[test]
    fn slot_accounting_covers_dispatched_statuses() {
        assert!(TaskStatus::Queued.holds_slot());
        assert!(TaskStatus::Running.holds_slot());
        assert!(!TaskStatus::Registering.holds_slot());
        assert!(!TaskStatus::AdjustingResources.holds_slot());
        assert!(!TaskStatus::Done.holds_slot());
        assert!(!TaskStatus::ErrorRecoverable.holds_slot());
    }

    #[test]
    fn instance_status_adds_kill_self() {
        assert_eq!(InstanceStatus::parse("K"), Some(InstanceStatus::KillSelf));
        assert_eq!(
            InstanceStatus::parse("R"),
            Some(InstanceStatus::Task(TaskStatus::Running))
        );
        assert_eq!(InstanceStatus::KillSelf.as_str(), "K");
        assert!(InstanceStatus::KillSelf.is_settled());
        assert!(!InstanceStatus::Task(TaskStatus::Running).is_settled());
    }

    #[test]
    fn run_status_roundtrip() {
        for status in [
            RunStatus::Initializing,
            RunStatus::Bound,
            RunStatus::Running,
            RunStatus::Done,
            RunStatus::Error,
            RunStatus::Halted,
            RunStatus::Terminated,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("invalid"), None);
    }

    #[test]
    fn exit_reasons_map_to_terminal_run_statuses() {
        assert_eq!(ExitReason::Completed.run_status(), RunStatus::Done);
        assert_eq!(ExitReason::TaskFailures.run_status(), RunStatus::Error);
        assert_eq!(
            ExitReason::ForcedHalt(HaltKind::ColdResume).run_status(),
            RunStatus::Halted
        );
        assert_eq!(ExitReason::TimedOut.run_status(), RunStatus::Terminated);
        assert_eq!(ExitReason::HeartbeatUnhealthy.run_status(), RunStatus::Terminated);
        for reason in [
            ExitReason::Completed,
            ExitReason::TaskFailures,
            ExitReason::ServerTerminate,
            ExitReason::SyncFailures,
            ExitReason::OperatorShutdown,
        ] {
            assert!(reason.run_status().is_terminal());
        }
    }
}
