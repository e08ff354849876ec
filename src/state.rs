//! In-memory execution state of one workflow run.
//!
//! [`SwarmState`] mirrors the server's view of every task and derives the
//! dispatch fringe from it. Status updates apply monotonically: a delta that
//! would move a task backwards through its lifecycle is dropped, so replayed
//! or reordered pages cannot corrupt the run. All bookkeeping off a single
//! update touches only the affected task and its downstream subgraph.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::gateway::{RunSnapshot, TaskErrorKind, TaskStatusUpdate};
use crate::resources::{ClusterLimits, TaskResources};
use crate::status::TaskStatus;
use crate::workflow::{TaskId, TemplateId, Workflow};

// ============================================================================
// Dispositions
// ============================================================================

/// What applying one status update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDisposition {
    /// The task moved forward.
    Applied,
    /// Same status again; dropped.
    Duplicate,
    /// The update would move the task backwards; dropped.
    Regressive,
    /// No such task; dropped.
    Unknown,
}

/// Outcome of resolving a task that ended in a recoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The task is re-armed and back on the fringe with this request.
    Requeued { resources: TaskResources },
    /// Attempts are exhausted; the task is now fatally failed.
    Exhausted,
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug)]
struct SwarmTask {
    template: TemplateId,
    status: TaskStatus,
    attempts: u32,
    max_attempts: u32,
    /// Current resource request, including any retry scaling.
    requested: TaskResources,
    pending_upstreams: usize,
    downstream: Vec<TaskId>,
}

/// Status cache and dispatch fringe for one run.
#[derive(Debug)]
pub struct SwarmState {
    workflow: Arc<Workflow>,
    tasks: HashMap<TaskId, SwarmTask>,
    /// Dispatch-ready tasks in admission order. Entries carry the admission
    /// sequence at which they were pushed; an entry is live only while
    /// `fringe_pos` still maps its task to that sequence, so superseded
    /// copies fall out on pop.
    fringe: VecDeque<(u64, TaskId)>,
    fringe_pos: HashMap<TaskId, u64>,
    fringe_seq: u64,
    /// Tasks holding a concurrency slot (queued through running).
    in_flight: HashSet<TaskId>,
    /// Tasks from a batch whose queue outcome is unknown. They keep their
    /// slots until the server confirms or a snapshot refutes the dispatch.
    parked: HashSet<TaskId>,
    done: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    /// Tasks that can never run because an ancestor failed.
    blocked: HashSet<TaskId>,
    template_used: HashMap<TemplateId, usize>,
    template_limit_overrides: HashMap<TemplateId, Option<usize>>,
    workflow_limit: Option<usize>,
    cluster_limits: ClusterLimits,
}

impl SwarmState {
    pub fn from_workflow(workflow: Arc<Workflow>) -> Self {
        let mut tasks = HashMap::with_capacity(workflow.task_count());
        for spec in workflow.tasks() {
            let requested = spec.resources.clone().unwrap_or_else(|| {
                workflow
                    .template(spec.template)
                    .map(|template| template.default_resources.clone())
                    .unwrap_or_default()
            });
            let max_attempts = spec.max_attempts.unwrap_or_else(|| {
                workflow
                    .template(spec.template)
                    .map(|template| template.max_attempts)
                    .unwrap_or(crate::workflow::DEFAULT_MAX_ATTEMPTS)
            });
            tasks.insert(
                spec.id,
                SwarmTask {
                    template: spec.template,
                    status: TaskStatus::Registering,
                    attempts: 0,
                    max_attempts,
                    requested,
                    pending_upstreams: spec.upstreams.len(),
                    downstream: Vec::new(),
                },
            );
        }
        for (up, down) in workflow.edges() {
            if let Some(task) = tasks.get_mut(up) {
                task.downstream.push(*down);
            }
        }
        let mut state = Self {
            workflow,
            tasks,
            fringe: VecDeque::new(),
            fringe_pos: HashMap::new(),
            fringe_seq: 0,
            in_flight: HashSet::new(),
            parked: HashSet::new(),
            done: HashSet::new(),
            failed: HashSet::new(),
            blocked: HashSet::new(),
            template_used: HashMap::new(),
            template_limit_overrides: HashMap::new(),
            workflow_limit: None,
            cluster_limits: ClusterLimits::unbounded(),
        };
        state.recompute_fringe();
        state
    }

    /// Rebuild state from a server snapshot. Terminal statuses are kept;
    /// anything that was in flight when the previous run died is reset to
    /// the beginning with its attempt count preserved. Recoverable errors
    /// are left as-is for the caller to resolve.
    pub fn from_snapshot(workflow: Arc<Workflow>, snapshot: &RunSnapshot) -> Self {
        let mut state = Self::from_workflow(workflow);
        for row in &snapshot.tasks {
            let Some(task) = state.tasks.get_mut(&row.task_id) else {
                continue;
            };
            task.attempts = row.attempts;
            task.status = match row.status {
                TaskStatus::Done => TaskStatus::Done,
                TaskStatus::ErrorFatal => TaskStatus::ErrorFatal,
                TaskStatus::ErrorRecoverable => TaskStatus::ErrorRecoverable,
                _ => TaskStatus::Registering,
            };
        }
        state.rebuild_derived();
        state
    }

    // ------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------

    pub fn set_workflow_limit(&mut self, limit: Option<usize>) {
        self.workflow_limit = limit;
    }

    pub fn set_template_limit(&mut self, template: TemplateId, limit: Option<usize>) {
        self.template_limit_overrides.insert(template, limit);
    }

    pub fn set_cluster_limits(&mut self, limits: ClusterLimits) {
        self.cluster_limits = limits;
    }

    pub fn workflow_limit(&self) -> Option<usize> {
        self.workflow_limit
    }

    pub fn template_limit(&self, template: TemplateId) -> Option<usize> {
        if let Some(limit) = self.template_limit_overrides.get(&template) {
            return *limit;
        }
        self.workflow
            .template(template)
            .and_then(|spec| spec.max_concurrently_running)
    }

    pub fn template_available(&self, template: TemplateId) -> bool {
        match self.template_limit(template) {
            Some(cap) => self.template_slots_in_use(template) < cap,
            None => true,
        }
    }

    pub fn template_slots_in_use(&self, template: TemplateId) -> usize {
        self.template_used.get(&template).copied().unwrap_or(0)
    }

    pub fn slots_in_use(&self) -> usize {
        self.in_flight.len()
    }

    // ------------------------------------------------------------------
    // Status Updates
    // ------------------------------------------------------------------

    /// Apply one server status update. Duplicates, regressions, and unknown
    /// tasks are dropped; the cache only ever moves forward.
    pub fn apply_status_update(&mut self, update: &TaskStatusUpdate) -> ApplyDisposition {
        // Any server-logged change proves a parked dispatch reached it.
        if self.parked.remove(&update.task_id) {
            debug!(task_id = %update.task_id, "ambiguous dispatch confirmed by server");
        }
        let Some(task) = self.tasks.get_mut(&update.task_id) else {
            warn!(
                task_id = %update.task_id,
                status = update.status.as_str(),
                "dropping status update for unknown task"
            );
            return ApplyDisposition::Unknown;
        };
        if update.attempts > task.attempts {
            task.attempts = update.attempts;
        }
        if update.status == task.status {
            return ApplyDisposition::Duplicate;
        }
        if !task.status.may_transition(update.status) {
            debug!(
                task_id = %update.task_id,
                from = task.status.as_str(),
                to = update.status.as_str(),
                "dropping regressive status update"
            );
            return ApplyDisposition::Regressive;
        }
        let previous = task.status;
        let template = task.template;
        task.status = update.status;
        self.note_transition(update.task_id, template, previous, update.status);
        ApplyDisposition::Applied
    }

    fn note_transition(
        &mut self,
        id: TaskId,
        template: TemplateId,
        previous: TaskStatus,
        status: TaskStatus,
    ) {
        match (previous.holds_slot(), status.holds_slot()) {
            (false, true) => {
                if self.in_flight.insert(id) {
                    *self.template_used.entry(template).or_default() += 1;
                }
                self.fringe_pos.remove(&id);
            }
            (true, false) => {
                if self.in_flight.remove(&id) {
                    if let Some(used) = self.template_used.get_mut(&template) {
                        *used = used.saturating_sub(1);
                    }
                }
            }
            _ => {}
        }
        match status {
            TaskStatus::Done => {
                self.done.insert(id);
                self.fringe_pos.remove(&id);
                self.complete_downstreams(id);
            }
            TaskStatus::ErrorFatal => {
                self.failed.insert(id);
                self.fringe_pos.remove(&id);
                self.block_descendants(id);
            }
            TaskStatus::AdjustingResources => {
                self.admit_if_ready(id);
            }
            _ => {}
        }
    }

    fn complete_downstreams(&mut self, id: TaskId) {
        let downstream = match self.tasks.get(&id) {
            Some(task) => task.downstream.clone(),
            None => return,
        };
        for next in downstream {
            let ready = {
                let Some(task) = self.tasks.get_mut(&next) else {
                    continue;
                };
                task.pending_upstreams = task.pending_upstreams.saturating_sub(1);
                task.pending_upstreams == 0
            };
            if ready {
                self.admit_if_ready(next);
            }
        }
    }

    /// Walk the downstream subgraph of a failed task and mark everything
    /// that has not started as blocked. Subtrees behind an already-done
    /// descendant are reachable through satisfied dependencies and are left
    /// alone.
    fn block_descendants(&mut self, root: TaskId) {
        let mut queue: VecDeque<TaskId> = match self.tasks.get(&root) {
            Some(task) => task.downstream.iter().copied().collect(),
            None => return,
        };
        while let Some(id) = queue.pop_front() {
            if self.blocked.contains(&id) {
                continue;
            }
            let (terminal, dispatchable, downstream) = {
                let Some(task) = self.tasks.get(&id) else {
                    continue;
                };
                (
                    task.status.is_task_terminal(),
                    matches!(
                        task.status,
                        TaskStatus::Registering | TaskStatus::AdjustingResources
                    ),
                    task.downstream.clone(),
                )
            };
            if terminal {
                continue;
            }
            if dispatchable {
                self.blocked.insert(id);
                self.fringe_pos.remove(&id);
            }
            queue.extend(downstream);
        }
    }

    fn admit_if_ready(&mut self, id: TaskId) {
        let eligible = {
            let Some(task) = self.tasks.get(&id) else {
                return;
            };
            matches!(
                task.status,
                TaskStatus::Registering | TaskStatus::AdjustingResources
            ) && task.pending_upstreams == 0
        };
        if eligible
            && !self.blocked.contains(&id)
            && !self.in_flight.contains(&id)
            && !self.parked.contains(&id)
            && !self.fringe_pos.contains_key(&id)
        {
            self.fringe_seq += 1;
            self.fringe_pos.insert(id, self.fringe_seq);
            self.fringe.push_back((self.fringe_seq, id));
        }
    }

    // ------------------------------------------------------------------
    // Dispatch Bookkeeping
    // ------------------------------------------------------------------

    /// Next dispatch-ready task in admission order, or None when the fringe
    /// is empty. Superseded entries are discarded on the way.
    pub fn pop_ready(&mut self) -> Option<TaskId> {
        while let Some((seq, id)) = self.fringe.pop_front() {
            if self.fringe_pos.get(&id) == Some(&seq) {
                self.fringe_pos.remove(&id);
                return Some(id);
            }
        }
        None
    }

    /// Put scanned-but-untaken tasks back at the head of the fringe in their
    /// original order.
    pub fn restore_ready_front(&mut self, ids: Vec<TaskId>) {
        for id in ids.into_iter().rev() {
            if !self.fringe_pos.contains_key(&id) {
                self.fringe_seq += 1;
                self.fringe_pos.insert(id, self.fringe_seq);
                self.fringe.push_front((self.fringe_seq, id));
            }
        }
    }

    /// Optimistically mark a task queued and charge its slot. Returns the
    /// resource request and attempt number for the queue entry.
    pub fn commit_dispatch(&mut self, id: TaskId) -> Option<(TaskResources, u32)> {
        let (template, resources, attempt) = {
            let task = self.tasks.get_mut(&id)?;
            if !matches!(
                task.status,
                TaskStatus::Registering | TaskStatus::AdjustingResources
            ) {
                return None;
            }
            task.status = TaskStatus::Queued;
            task.attempts += 1;
            (task.template, task.requested.clone(), task.attempts)
        };
        self.fringe_pos.remove(&id);
        if self.in_flight.insert(id) {
            *self.template_used.entry(template).or_default() += 1;
        }
        Some((resources, attempt))
    }

    /// Undo an optimistic commit the server never saw: the task goes back to
    /// the fringe and the attempt is uncounted.
    pub fn release_dispatch(&mut self, id: TaskId) {
        let template = {
            let Some(task) = self.tasks.get_mut(&id) else {
                return;
            };
            if task.status != TaskStatus::Queued {
                return;
            }
            task.status = TaskStatus::Registering;
            task.attempts = task.attempts.saturating_sub(1);
            task.template
        };
        if self.in_flight.remove(&id) {
            if let Some(used) = self.template_used.get_mut(&template) {
                *used = used.saturating_sub(1);
            }
        }
        self.parked.remove(&id);
        self.admit_if_ready(id);
    }

    /// Park a committed task whose queue outcome is unknown. It keeps its
    /// slot so the run cannot over-dispatch while the question is open.
    pub fn park_dispatch(&mut self, id: TaskId) {
        if self.tasks.contains_key(&id) {
            self.parked.insert(id);
        }
    }

    pub fn is_parked(&self, id: TaskId) -> bool {
        self.parked.contains(&id)
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Settle every parked task against an authoritative snapshot: a task
    /// the server still shows unstarted was never queued and is released;
    /// anything else is confirmed. Returns (confirmed, released).
    pub fn reconcile_parked(&mut self, snapshot: &RunSnapshot) -> (usize, usize) {
        let rows: HashMap<TaskId, TaskStatus> = snapshot
            .tasks
            .iter()
            .map(|row| (row.task_id, row.status))
            .collect();
        let parked: Vec<TaskId> = self.parked.iter().copied().collect();
        let mut confirmed = 0;
        let mut released = 0;
        for id in parked {
            match rows.get(&id) {
                Some(TaskStatus::Registering) | None => {
                    self.release_dispatch(id);
                    released += 1;
                }
                Some(_) => {
                    self.parked.remove(&id);
                    confirmed += 1;
                }
            }
        }
        (confirmed, released)
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    /// Decide what happens to a task sitting in a recoverable error: re-arm
    /// it for another attempt, or declare it fatally failed once attempts
    /// are exhausted. A resource-kind error scales the next request per the
    /// template's policy.
    pub fn resolve_recoverable(
        &mut self,
        id: TaskId,
        error: Option<TaskErrorKind>,
    ) -> Option<RetryDecision> {
        let (template, attempts, max_attempts) = {
            let task = self.tasks.get(&id)?;
            if task.status != TaskStatus::ErrorRecoverable {
                return None;
            }
            (task.template, task.attempts, task.max_attempts)
        };
        if attempts >= max_attempts {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::ErrorFatal;
            }
            self.failed.insert(id);
            self.fringe_pos.remove(&id);
            self.block_descendants(id);
            warn!(
                task_id = %id,
                attempts,
                "task exhausted its attempts, marking fatally failed"
            );
            return Some(RetryDecision::Exhausted);
        }

        let next_attempt = attempts + 1;
        let resources = if error == Some(TaskErrorKind::Resource) {
            let original = self
                .workflow
                .task_resources(id)
                .unwrap_or_else(|_| TaskResources::default());
            let scaled = self
                .workflow
                .template(template)
                .map(|spec| {
                    spec.scaling
                        .request_for_attempt(&original, next_attempt, &self.cluster_limits)
                })
                .unwrap_or(original);
            if let Some(task) = self.tasks.get_mut(&id) {
                task.requested = scaled.clone();
            }
            scaled
        } else {
            self.tasks
                .get(&id)
                .map(|task| task.requested.clone())
                .unwrap_or_default()
        };
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::AdjustingResources;
        }
        metrics::counter!("belay_tasks_requeued_total").increment(1);
        self.admit_if_ready(id);
        Some(RetryDecision::Requeued { resources })
    }

    // ------------------------------------------------------------------
    // Rebuild
    // ------------------------------------------------------------------

    /// Recompute every derived set from task statuses alone. Used after
    /// snapshot-based construction; steady-state updates maintain the sets
    /// incrementally.
    fn rebuild_derived(&mut self) {
        self.in_flight.clear();
        self.parked.clear();
        self.done.clear();
        self.failed.clear();
        self.blocked.clear();
        self.template_used.clear();

        let mut failed = Vec::new();
        for (id, task) in &self.tasks {
            match task.status {
                TaskStatus::Done => {
                    self.done.insert(*id);
                }
                TaskStatus::ErrorFatal => {
                    self.failed.insert(*id);
                    failed.push(*id);
                }
                status if status.holds_slot() => {
                    self.in_flight.insert(*id);
                    *self.template_used.entry(task.template).or_default() += 1;
                }
                _ => {}
            }
        }

        let workflow = Arc::clone(&self.workflow);
        for spec in workflow.tasks() {
            let pending = spec
                .upstreams
                .iter()
                .filter(|up| !self.done.contains(up))
                .count();
            if let Some(task) = self.tasks.get_mut(&spec.id) {
                task.pending_upstreams = pending;
            }
        }

        for id in failed {
            self.block_descendants(id);
        }
        self.recompute_fringe();
    }

    /// Rebuild the fringe from scratch in task-id order.
    pub fn recompute_fringe(&mut self) {
        self.fringe.clear();
        self.fringe_pos.clear();
        let mut ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(id, task)| {
                matches!(
                    task.status,
                    TaskStatus::Registering | TaskStatus::AdjustingResources
                ) && task.pending_upstreams == 0
                    && !self.blocked.contains(id)
                    && !self.in_flight.contains(id)
                    && !self.parked.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        for id in ready {
            self.fringe_seq += 1;
            self.fringe_pos.insert(id, self.fringe_seq);
            self.fringe.push_back((self.fringe_seq, id));
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|task| task.status)
    }

    pub fn attempts_of(&self, id: TaskId) -> Option<u32> {
        self.tasks.get(&id).map(|task| task.attempts)
    }

    pub fn current_request(&self, id: TaskId) -> Option<TaskResources> {
        self.tasks.get(&id).map(|task| task.requested.clone())
    }

    pub fn is_blocked(&self, id: TaskId) -> bool {
        self.blocked.contains(&id)
    }

    /// Live fringe contents in dispatch order.
    pub fn fringe_snapshot(&self) -> Vec<TaskId> {
        self.fringe
            .iter()
            .filter(|(seq, id)| self.fringe_pos.get(id) == Some(seq))
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn fringe_len(&self) -> usize {
        self.fringe_pos.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_tasks(&self) -> Vec<TaskId> {
        let mut failed: Vec<TaskId> = self.failed.iter().copied().collect();
        failed.sort();
        failed
    }

    pub fn statuses(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.tasks
            .iter()
            .map(|(id, task)| (*id, task.status))
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.as_str()).or_default() += 1;
        }
        counts
    }

    /// Tasks in a recoverable error awaiting a retry decision.
    pub fn unresolved_errors(&self) -> Vec<TaskId> {
        let mut errored: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.status == TaskStatus::ErrorRecoverable)
            .map(|(id, _)| *id)
            .collect();
        errored.sort();
        errored
    }

    /// The run is settled when nothing can dispatch, nothing is in flight,
    /// and every task has landed in done, failed, or blocked. An empty
    /// workflow is settled immediately.
    pub fn is_settled(&self) -> bool {
        self.fringe_pos.is_empty()
            && self.in_flight.is_empty()
            && self.parked.is_empty()
            && self.done.len() + self.failed.len() + self.blocked.len() == self.tasks.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
