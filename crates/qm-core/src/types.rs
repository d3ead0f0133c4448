use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{TaskId, WorkflowId};

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Completed -> Running` is allowed so that later phases (plan, execute,
    /// replan) can be driven on a workflow whose previous phase finished.
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        matches!(
            (self, target),
            (WorkflowStatus::Pending, WorkflowStatus::Running)
                | (WorkflowStatus::Pending, WorkflowStatus::Failed)
                | (WorkflowStatus::Running, WorkflowStatus::Paused)
                | (WorkflowStatus::Running, WorkflowStatus::Completed)
                | (WorkflowStatus::Running, WorkflowStatus::Failed)
                | (WorkflowStatus::Running, WorkflowStatus::Stopped)
                | (WorkflowStatus::Paused, WorkflowStatus::Running)
                | (WorkflowStatus::Paused, WorkflowStatus::Stopped)
                | (WorkflowStatus::Paused, WorkflowStatus::Failed)
                | (WorkflowStatus::Completed, WorkflowStatus::Running)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Valid transitions, including the retry path `Running -> Queued`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Skipped)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
}

impl Phase {
    /// The ordered pipeline phases.
    pub fn pipeline_order() -> &'static [Phase] {
        &[Phase::Refine, Phase::Analyze, Phase::Plan, Phase::Execute]
    }

    /// Directory name of the phase's artifacts inside the run directory.
    /// Refine artifacts live alongside analyze output.
    pub fn artifact_dir(&self) -> &'static str {
        match self {
            Phase::Refine | Phase::Analyze => "analyze-phase",
            Phase::Plan => "plan-phase",
            Phase::Execute => "execute-phase",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Refine => "refine",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KanbanColumn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Refinement,
    Todo,
    InProgress,
    ToVerify,
    Done,
}

impl KanbanColumn {
    /// The fixed column order of the board.
    pub fn ordered() -> &'static [KanbanColumn] {
        &[
            KanbanColumn::Refinement,
            KanbanColumn::Todo,
            KanbanColumn::InProgress,
            KanbanColumn::ToVerify,
            KanbanColumn::Done,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KanbanColumn::Refinement => "refinement",
            KanbanColumn::Todo => "todo",
            KanbanColumn::InProgress => "in_progress",
            KanbanColumn::ToVerify => "to_verify",
            KanbanColumn::Done => "done",
        }
    }
}

// ---------------------------------------------------------------------------
// AgentFailureKind
// ---------------------------------------------------------------------------

/// Failure kinds an agent can report. Mirrors the closed set of the agent
/// capability contract; retryability drives the scheduler's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFailureKind {
    Timeout,
    Canceled,
    InvalidOutput,
    Transport,
    RateLimited,
    Internal,
}

impl AgentFailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentFailureKind::Timeout
                | AgentFailureKind::Transport
                | AgentFailureKind::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentFailureKind::Timeout => "timeout",
            AgentFailureKind::Canceled => "canceled",
            AgentFailureKind::InvalidOutput => "invalid_output",
            AgentFailureKind::Transport => "transport",
            AgentFailureKind::RateLimited => "rate_limited",
            AgentFailureKind::Internal => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    MultiAgent,
    SingleAgent,
}

/// Per-workflow execution settings. Defaults come from the engine section of
/// the config file; API callers may override any field at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub single_agent_name: Option<String>,
    #[serde(default)]
    pub single_agent_model: Option<String>,
    #[serde(default)]
    pub single_agent_reasoning_effort: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_sandbox")]
    pub sandbox_enabled: bool,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_analysis_rounds")]
    pub analysis_rounds: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_mode: default_execution_mode(),
            single_agent_name: None,
            single_agent_model: None,
            single_agent_reasoning_effort: None,
            dry_run: false,
            sandbox_enabled: default_sandbox(),
            timeout_s: default_timeout_s(),
            max_retries: default_max_retries(),
            analysis_rounds: default_analysis_rounds(),
            consensus_threshold: default_consensus_threshold(),
        }
    }
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::MultiAgent
}
fn default_sandbox() -> bool {
    true
}
fn default_timeout_s() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    2
}
fn default_analysis_rounds() -> u32 {
    2
}
fn default_consensus_threshold() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub title: String,
    pub prompt: String,
    pub optimized_prompt: Option<String>,
    pub current_phase: Option<Phase>,
    pub status: WorkflowStatus,
    pub config: ExecutionConfig,
    pub kanban_column: KanbanColumn,
    pub error: Option<String>,
    pub report_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(prompt: impl Into<String>, title: Option<String>, config: ExecutionConfig) -> Self {
        let prompt = prompt.into();
        let title = title.unwrap_or_else(|| derive_title(&prompt));
        let now = Utc::now();
        Self {
            id: WorkflowId::generate(),
            title,
            prompt,
            optimized_prompt: None,
            current_phase: None,
            status: WorkflowStatus::Pending,
            config,
            kanban_column: KanbanColumn::Todo,
            error: None,
            report_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// First line of the prompt, truncated to 80 characters, as a display title.
fn derive_title(prompt: &str) -> String {
    let first = prompt.lines().next().unwrap_or("").trim();
    let mut title: String = first.chars().take(80).collect();
    if title.is_empty() {
        title = "untitled workflow".to_string();
    }
    title
}

// ---------------------------------------------------------------------------
// WorkflowPatch
// ---------------------------------------------------------------------------

/// The closed set of workflow fields a mutation may touch.
///
/// `error` uses a nested option: `Some(None)` clears a previous error.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub title: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub current_phase: Option<Phase>,
    pub config: Option<ExecutionConfig>,
    pub kanban_column: Option<KanbanColumn>,
    pub error: Option<Option<String>>,
    pub optimized_prompt: Option<String>,
    pub report_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowPatch {
    pub fn status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn column(column: KanbanColumn) -> Self {
        Self {
            kanban_column: Some(column),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.current_phase = Some(phase);
        self
    }

    /// Apply the patch in place, bumping `updated_at`.
    pub fn apply(&self, wf: &mut Workflow) {
        if let Some(title) = &self.title {
            wf.title = title.clone();
        }
        if let Some(status) = self.status {
            wf.status = status;
        }
        if let Some(phase) = self.current_phase {
            wf.current_phase = Some(phase);
        }
        if let Some(config) = &self.config {
            wf.config = config.clone();
        }
        if let Some(column) = self.kanban_column {
            wf.kanban_column = column;
        }
        if let Some(error) = &self.error {
            wf.error = error.clone();
        }
        if let Some(p) = &self.optimized_prompt {
            wf.optimized_prompt = Some(p.clone());
        }
        if let Some(p) = &self.report_path {
            wf.report_path = Some(p.clone());
        }
        if let Some(t) = self.started_at {
            wf.started_at = Some(t);
        }
        if let Some(t) = self.finished_at {
            wf.finished_at = Some(t);
        }
        wf.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub agent: String,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub output: Option<String>,
    pub output_file: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub timeout_s: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        workflow_id: WorkflowId,
        name: impl Into<String>,
        agent: impl Into<String>,
        depends_on: Vec<TaskId>,
        timeout_s: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id,
            name: name.into(),
            agent: agent.into(),
            status: TaskStatus::Pending,
            depends_on,
            output: None,
            output_file: None,
            attempts: 0,
            error: None,
            timeout_s,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskPatch
// ---------------------------------------------------------------------------

/// The closed set of task fields a mutation may touch.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub output: Option<String>,
    pub output_file: Option<String>,
    pub attempts: Option<u32>,
    pub error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(output) = &self.output {
            task.output = Some(output.clone());
        }
        if let Some(file) = &self.output_file {
            task.output_file = Some(file.clone());
        }
        if let Some(attempts) = self.attempts {
            task.attempts = attempts;
        }
        if let Some(error) = &self.error {
            task.error = error.clone();
        }
        if let Some(t) = self.started_at {
            task.started_at = Some(t);
        }
        if let Some(t) = self.finished_at {
            task.finished_at = Some(t);
        }
        task.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(
        workflow_id: WorkflowId,
        file_name: impl Into<String>,
        size_bytes: u64,
        sha256: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            file_name: file_name.into(),
            size_bytes,
            sha256: sha256.into(),
            path: path.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowFilter
// ---------------------------------------------------------------------------

/// List filter: all present criteria are ANDed.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub kanban_column: Option<KanbanColumn>,
    pub query: Option<String>,
}

impl WorkflowFilter {
    pub fn matches(&self, wf: &Workflow) -> bool {
        if let Some(status) = self.status {
            if wf.status != status {
                return false;
            }
        }
        if let Some(column) = self.kanban_column {
            if wf.kanban_column != column {
                return false;
            }
        }
        if let Some(q) = &self.query {
            let q = q.to_lowercase();
            if !wf.title.to_lowercase().contains(&q) && !wf.prompt.to_lowercase().contains(&q) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_transitions() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Completed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
    }

    #[test]
    fn task_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Queued)); // retry
        assert!(Running.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Skipped));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Queued));
    }

    #[test]
    fn retryable_failure_kinds() {
        assert!(AgentFailureKind::Timeout.is_retryable());
        assert!(AgentFailureKind::Transport.is_retryable());
        assert!(AgentFailureKind::RateLimited.is_retryable());
        assert!(!AgentFailureKind::Canceled.is_retryable());
        assert!(!AgentFailureKind::InvalidOutput.is_retryable());
        assert!(!AgentFailureKind::Internal.is_retryable());
    }

    #[test]
    fn title_derived_from_prompt() {
        let wf = Workflow::new("Add a fuzz test\nand more detail", None, ExecutionConfig::default());
        assert_eq!(wf.title, "Add a fuzz test");

        let long = "x".repeat(200);
        let wf = Workflow::new(long, None, ExecutionConfig::default());
        assert_eq!(wf.title.chars().count(), 80);
    }

    #[test]
    fn workflow_patch_applies_and_clears_error() {
        let mut wf = Workflow::new("p", None, ExecutionConfig::default());
        WorkflowPatch::status(WorkflowStatus::Running)
            .with_error("boom")
            .apply(&mut wf);
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.error.as_deref(), Some("boom"));

        WorkflowPatch::default().clearing_error().apply(&mut wf);
        assert!(wf.error.is_none());
    }

    #[test]
    fn filter_is_anded() {
        let mut wf = Workflow::new("build the parser", None, ExecutionConfig::default());
        wf.status = WorkflowStatus::Pending;
        wf.kanban_column = KanbanColumn::Todo;

        let f = WorkflowFilter {
            status: Some(WorkflowStatus::Pending),
            kanban_column: Some(KanbanColumn::Todo),
            query: Some("parser".into()),
        };
        assert!(f.matches(&wf));

        let f = WorkflowFilter {
            query: Some("compiler".into()),
            ..f
        };
        assert!(!f.matches(&wf));
    }
}
