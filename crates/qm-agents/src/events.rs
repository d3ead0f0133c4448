use serde::{Deserialize, Serialize};

use qm_core::types::AgentFailureKind;

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

/// The closed set of events an agent execution emits, in stream order:
/// `Started`, then any number of intermediate events, then exactly one of
/// `Completed` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Started,
    Thinking {
        text: String,
    },
    ToolUse {
        tool: String,
        args: serde_json::Value,
    },
    Progress {
        fraction: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PartialOutput {
        delta: String,
    },
    Completed {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
        /// Unified diff of the code changes the agent made, when it made any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    Error {
        kind: AgentFailureKind,
        message: String,
    },
}

impl AgentEvent {
    /// `true` for the events that terminate a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Completed { .. } | AgentEvent::Error { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_detection() {
        assert!(AgentEvent::Completed {
            output: "done".into(),
            output_file: None,
            diff: None
        }
        .is_terminal());
        assert!(AgentEvent::Error {
            kind: AgentFailureKind::Transport,
            message: "reset".into()
        }
        .is_terminal());
        assert!(!AgentEvent::Started.is_terminal());
        assert!(!AgentEvent::PartialOutput { delta: "x".into() }.is_terminal());
    }

    #[test]
    fn tagged_wire_shape() {
        let ev = AgentEvent::ToolUse {
            tool: "file_read".into(),
            args: serde_json::json!({"path": "src/lib.rs"}),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["tool"], "file_read");
    }
}
