use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use qm_core::{TaskId, WorkflowId};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// The closed set of event types published on the bus. The wire names are
/// the dotted forms (`workflow.created`, `task.failed`, ...), which are also
/// the SSE `event:` field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // --- workflow lifecycle ---
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.phase_started")]
    WorkflowPhaseStarted,
    #[serde(rename = "workflow.phase_completed")]
    WorkflowPhaseCompleted,
    #[serde(rename = "workflow.status_changed")]
    WorkflowStatusChanged,
    #[serde(rename = "workflow.error")]
    WorkflowError,

    // --- task ---
    #[serde(rename = "task.queued")]
    TaskQueued,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.skipped")]
    TaskSkipped,

    // --- agent ---
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.thinking")]
    AgentThinking,
    #[serde(rename = "agent.tool_use")]
    AgentToolUse,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.error")]
    AgentError,

    // --- artifact ---
    #[serde(rename = "artifact.written")]
    ArtifactWritten,

    // --- kanban ---
    #[serde(rename = "kanban.moved")]
    KanbanMoved,
    #[serde(rename = "kanban.engine_state_changed")]
    KanbanEngineStateChanged,
    #[serde(rename = "kanban.circuit_breaker_opened")]
    KanbanCircuitBreakerOpened,
    #[serde(rename = "kanban.circuit_breaker_reset")]
    KanbanCircuitBreakerReset,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowCreated => "workflow.created",
            EventKind::WorkflowPhaseStarted => "workflow.phase_started",
            EventKind::WorkflowPhaseCompleted => "workflow.phase_completed",
            EventKind::WorkflowStatusChanged => "workflow.status_changed",
            EventKind::WorkflowError => "workflow.error",
            EventKind::TaskQueued => "task.queued",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskProgress => "task.progress",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskSkipped => "task.skipped",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentThinking => "agent.thinking",
            EventKind::AgentToolUse => "agent.tool_use",
            EventKind::AgentCompleted => "agent.completed",
            EventKind::AgentError => "agent.error",
            EventKind::ArtifactWritten => "artifact.written",
            EventKind::KanbanMoved => "kanban.moved",
            EventKind::KanbanEngineStateChanged => "kanban.engine_state_changed",
            EventKind::KanbanCircuitBreakerOpened => "kanban.circuit_breaker_opened",
            EventKind::KanbanCircuitBreakerReset => "kanban.circuit_breaker_reset",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A typed, timestamped record of one state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(project_id: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            workflow_id: None,
            task_id: None,
            agent: None,
            kind,
            payload,
        }
    }

    pub fn for_workflow(
        project_id: impl Into<String>,
        workflow_id: WorkflowId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        let mut ev = Self::new(project_id, kind, payload);
        ev.workflow_id = Some(workflow_id);
        ev
    }

    pub fn for_task(
        project_id: impl Into<String>,
        workflow_id: WorkflowId,
        task_id: TaskId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        let mut ev = Self::for_workflow(project_id, workflow_id, kind, payload);
        ev.task_id = Some(task_id);
        ev
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_dotted() {
        let json = serde_json::to_string(&EventKind::TaskFailed).unwrap();
        assert_eq!(json, "\"task.failed\"");
        let back: EventKind = serde_json::from_str("\"kanban.circuit_breaker_opened\"").unwrap();
        assert_eq!(back, EventKind::KanbanCircuitBreakerOpened);
    }

    #[test]
    fn event_wire_shape() {
        let ev = Event::for_task(
            "quorum",
            WorkflowId::from("wf-20250101-000000-aaaaa"),
            TaskId::new("task-01"),
            EventKind::TaskStarted,
            serde_json::json!({"attempt": 1}),
        )
        .with_agent("claude");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event_type"], "task.started");
        assert_eq!(v["workflow_id"], "wf-20250101-000000-aaaaa");
        assert_eq!(v["task_id"], "task-01");
        assert_eq!(v["agent"], "claude");
        assert_eq!(v["payload"]["attempt"], 1);
    }
}
