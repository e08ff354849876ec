//! Workflow definitions: task templates, tasks, and the dependency graph.
//!
//! A [`Workflow`] is the client-side description of a run. Tasks are identified
//! by dense [`TaskId`]s assigned in insertion order; node identity for
//! deduplication is the (template, argument map) pair.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::resources::{ResourceScalingPolicy, TaskResources};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identity of a workflow across processes and resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one execution of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowRunId(pub Uuid);

impl WorkflowRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense per-workflow task index, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense per-workflow template index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u32);

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Templates & Tasks
// ============================================================================

/// Parameters for registering a task template.
#[derive(Clone, Debug)]
pub struct TemplateSpec {
    pub name: String,
    /// Per-template concurrency limit. `None` means unbounded.
    pub max_concurrently_running: Option<usize>,
    pub default_resources: TaskResources,
    pub scaling: ResourceScalingPolicy,
    pub max_attempts: u32,
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrently_running: None,
            default_resources: TaskResources::default(),
            scaling: ResourceScalingPolicy::Constant,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl TemplateSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// A registered task template.
#[derive(Clone, Debug)]
pub struct TaskTemplate {
    pub id: TemplateId,
    pub name: String,
    pub max_concurrently_running: Option<usize>,
    pub default_resources: TaskResources,
    pub scaling: ResourceScalingPolicy,
    pub max_attempts: u32,
}

/// A task node in the workflow graph.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub id: TaskId,
    pub template: TemplateId,
    pub args: BTreeMap<String, String>,
    /// Per-task override of the template's default resources.
    pub resources: Option<TaskResources>,
    /// Per-task override of the template's max attempts.
    pub max_attempts: Option<u32>,
    pub upstreams: Vec<TaskId>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown template: {0}")]
    UnknownTemplate(TemplateId),
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("duplicate task node: template {template} args {args}")]
    DuplicateTask { template: String, args: String },
    #[error("task {0} cannot depend on itself")]
    SelfDependency(TaskId),
    #[error("dependency cycle through {} edge(s): {}", edges.len(), render_edges(edges))]
    Cycle { edges: Vec<(TaskId, TaskId)> },
}

fn render_edges(edges: &[(TaskId, TaskId)]) -> String {
    let rendered: Vec<String> = edges
        .iter()
        .map(|(up, down)| format!("{up}->{down}"))
        .collect();
    rendered.join(", ")
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

// ============================================================================
// Workflow
// ============================================================================

/// Client-side workflow definition.
#[derive(Clone, Debug)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    templates: Vec<TaskTemplate>,
    tasks: Vec<TaskSpec>,
    identities: HashMap<(TemplateId, String), TaskId>,
    edges: Vec<(TaskId, TaskId)>,
    edge_set: HashSet<(TaskId, TaskId)>,
}

impl Workflow {
    pub fn new(name: &str) -> Self {
        Self::with_id(WorkflowId::new(), name)
    }

    /// Construct with a caller-supplied id, as required for resuming a
    /// workflow registered by an earlier process.
    pub fn with_id(id: WorkflowId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            templates: Vec::new(),
            tasks: Vec::new(),
            identities: HashMap::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_template(&mut self, spec: TemplateSpec) -> TemplateId {
        let id = TemplateId(self.templates.len() as u32);
        self.templates.push(TaskTemplate {
            id,
            name: spec.name,
            max_concurrently_running: spec.max_concurrently_running,
            default_resources: spec.default_resources,
            scaling: spec.scaling,
            max_attempts: spec.max_attempts.max(1),
        });
        id
    }

    /// Add a task under `template`. Two tasks with the same template and the
    /// same argument map are the same node; adding the second is an error.
    pub fn add_task<I, K, V>(&mut self, template: TemplateId, args: I) -> WorkflowResult<TaskId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if self.template(template).is_none() {
            return Err(WorkflowError::UnknownTemplate(template));
        }
        let args: BTreeMap<String, String> = args
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let identity = (template, canonical_args(&args));
        if self.identities.contains_key(&identity) {
            let template_name = self
                .template(template)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            return Err(WorkflowError::DuplicateTask {
                template: template_name,
                args: identity.1,
            });
        }
        let id = TaskId(self.tasks.len() as u64);
        self.identities.insert(identity, id);
        self.tasks.push(TaskSpec {
            id,
            template,
            args,
            resources: None,
            max_attempts: None,
            upstreams: Vec::new(),
        });
        Ok(id)
    }

    pub fn set_task_resources(
        &mut self,
        task: TaskId,
        resources: TaskResources,
    ) -> WorkflowResult<()> {
        let spec = self
            .tasks
            .get_mut(task.0 as usize)
            .ok_or(WorkflowError::UnknownTask(task))?;
        spec.resources = Some(resources);
        Ok(())
    }

    pub fn set_task_max_attempts(&mut self, task: TaskId, max_attempts: u32) -> WorkflowResult<()> {
        let spec = self
            .tasks
            .get_mut(task.0 as usize)
            .ok_or(WorkflowError::UnknownTask(task))?;
        spec.max_attempts = Some(max_attempts.max(1));
        Ok(())
    }

    /// Add a dependency edge `upstream -> downstream`. Duplicate edges are
    /// ignored.
    pub fn add_edge(&mut self, upstream: TaskId, downstream: TaskId) -> WorkflowResult<()> {
        if self.tasks.get(upstream.0 as usize).is_none() {
            return Err(WorkflowError::UnknownTask(upstream));
        }
        if self.tasks.get(downstream.0 as usize).is_none() {
            return Err(WorkflowError::UnknownTask(downstream));
        }
        if upstream == downstream {
            return Err(WorkflowError::SelfDependency(upstream));
        }
        if self.edge_set.insert((upstream, downstream)) {
            self.edges.push((upstream, downstream));
            self.tasks[downstream.0 as usize].upstreams.push(upstream);
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskSpec> {
        self.tasks.get(id.0 as usize)
    }

    pub fn templates(&self) -> &[TaskTemplate] {
        &self.templates
    }

    pub fn template(&self, id: TemplateId) -> Option<&TaskTemplate> {
        self.templates.get(id.0 as usize)
    }

    pub fn edges(&self) -> &[(TaskId, TaskId)] {
        &self.edges
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Effective resource request for a task: its override, or the template
    /// default.
    pub fn task_resources(&self, id: TaskId) -> WorkflowResult<TaskResources> {
        let spec = self.task(id).ok_or(WorkflowError::UnknownTask(id))?;
        if let Some(resources) = &spec.resources {
            return Ok(resources.clone());
        }
        let template = self
            .template(spec.template)
            .ok_or(WorkflowError::UnknownTemplate(spec.template))?;
        Ok(template.default_resources.clone())
    }

    /// Effective max attempts for a task.
    pub fn task_max_attempts(&self, id: TaskId) -> WorkflowResult<u32> {
        let spec = self.task(id).ok_or(WorkflowError::UnknownTask(id))?;
        if let Some(max_attempts) = spec.max_attempts {
            return Ok(max_attempts);
        }
        let template = self
            .template(spec.template)
            .ok_or(WorkflowError::UnknownTemplate(spec.template))?;
        Ok(template.max_attempts)
    }

    /// Validate the graph. Fails with the offending edge set when a
    /// dependency cycle exists.
    ///
    /// Kahn's algorithm over indegrees; any edge left untraversed after the
    /// queue drains lies on or behind a cycle.
    pub fn validate(&self) -> WorkflowResult<()> {
        let mut indegree: Vec<usize> = self.tasks.iter().map(|t| t.upstreams.len()).collect();
        let mut downstream: Vec<Vec<TaskId>> = vec![Vec::new(); self.tasks.len()];
        for (up, down) in &self.edges {
            downstream[up.0 as usize].push(*down);
        }

        let mut queue: VecDeque<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.upstreams.is_empty())
            .map(|t| t.id)
            .collect();
        let mut visited = 0usize;
        while let Some(task) = queue.pop_front() {
            visited += 1;
            for &next in &downstream[task.0 as usize] {
                indegree[next.0 as usize] -= 1;
                if indegree[next.0 as usize] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited == self.tasks.len() {
            return Ok(());
        }
        let stuck: HashSet<TaskId> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(idx, _)| TaskId(idx as u64))
            .collect();
        let mut edges: Vec<(TaskId, TaskId)> = self
            .edges
            .iter()
            .filter(|(up, down)| stuck.contains(up) && stuck.contains(down))
            .copied()
            .collect();
        edges.sort();
        Err(WorkflowError::Cycle { edges })
    }
}

fn canonical_args(args: &BTreeMap<String, String>) -> String {
    let mut rendered = String::new();
    for (key, value) in args {
        if !rendered.is_empty() {
            rendered.push('\u{1f}');
        }
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(value);
    }
    rendered
}

// ============================================================================
// Tests
// ============================================================================
