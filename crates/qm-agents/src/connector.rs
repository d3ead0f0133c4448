use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::AgentEvent;

// ---------------------------------------------------------------------------
// ExecuteRequest
// ---------------------------------------------------------------------------

/// One unit of work handed to an agent.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    /// Files the agent should read for context (attachments, prior phase
    /// artifacts).
    pub context_files: Vec<PathBuf>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout: Duration,
}

impl ExecuteRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            context_files: Vec::new(),
            model: None,
            reasoning_effort: None,
            timeout,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }
}

// ---------------------------------------------------------------------------
// AgentCapabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCapabilities {
    pub supports_reasoning: bool,
    pub available_models: Vec<String>,
    pub max_context_bytes: u64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            supports_reasoning: false,
            available_models: Vec::new(),
            max_context_bytes: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConnector
// ---------------------------------------------------------------------------

/// The uniform capability contract every concrete agent implements.
///
/// `execute` returns immediately with the receiving end of the event stream;
/// the connector drives the agent from its own task and feeds the channel.
/// The stream obeys `Started, (Thinking|ToolUse|Progress|PartialOutput)*,
/// (Completed|Error)` and then closes. Cancellation is cooperative through
/// the token: a cancelled execution terminates its stream with
/// `Error { kind: Canceled, .. }`.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    fn capabilities(&self) -> AgentCapabilities;

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> flume::Receiver<AgentEvent>;
}
