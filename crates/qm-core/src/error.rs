use serde::{Deserialize, Serialize};

use crate::ids::TaskId;
use crate::types::{AgentFailureKind, Phase};

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The closed error taxonomy. Every error surfaced by the orchestrator core
/// is one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad user input; never retried.
    Validation,
    /// Addressed entity missing.
    NotFound,
    /// State-machine violation (e.g. pause on a pending workflow).
    Conflict,
    /// Failure reported by an agent; the agent's own kind is carried in
    /// [`QuorumError::agent_kind`].
    AgentError,
    /// Plan phase output could not be parsed; fatal for the run.
    PlanParseError,
    /// Deadline exceeded at task or phase scope.
    Timeout,
    /// User-initiated stop or cancellation-scope propagation.
    Canceled,
    /// Bug or unexpected condition.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AgentError => "agent_error",
            ErrorKind::PlanParseError => "plan_parse_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// QuorumError
// ---------------------------------------------------------------------------

/// Structured, user-visible failure: `{ kind, message, task_id?, phase? }`.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct QuorumError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<AgentFailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

impl QuorumError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            agent_kind: None,
            task_id: None,
            phase: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn agent(kind: AgentFailureKind, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::AgentError, message);
        err.agent_kind = Some(kind);
        err
    }

    pub fn plan_parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlanParseError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Whether the scheduler may retry the underlying operation.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::AgentError
            && self.agent_kind.map(|k| k.is_retryable()).unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = QuorumError::conflict("pause on pending workflow");
        assert_eq!(err.to_string(), "conflict: pause on pending workflow");
    }

    #[test]
    fn agent_errors_carry_retryability() {
        let err = QuorumError::agent(AgentFailureKind::Transport, "connection reset");
        assert!(err.is_retryable());
        let err = QuorumError::agent(AgentFailureKind::InvalidOutput, "not json");
        assert!(!err.is_retryable());
        let err = QuorumError::timeout("phase deadline");
        assert!(!err.is_retryable());
    }

    #[test]
    fn serializes_structured_shape() {
        let err = QuorumError::plan_parse("missing json block")
            .with_phase(Phase::Plan)
            .with_task(TaskId::new("task-01"));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "plan_parse_error");
        assert_eq!(v["task_id"], "task-01");
        assert_eq!(v["phase"], "plan");

        let err = QuorumError::agent(AgentFailureKind::RateLimited, "429");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "agent_error");
        assert_eq!(v["agent_kind"], "rate_limited");
    }
}
