use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use qm_core::types::AgentFailureKind;

use crate::connector::{AgentCapabilities, AgentConnector, ExecuteRequest};
use crate::events::AgentEvent;

// ---------------------------------------------------------------------------
// ScriptedBehavior
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScriptedBehavior {
    /// Simulated work time before the terminal event.
    pub delay: Duration,
    pub result: ScriptedResult,
}

#[derive(Debug, Clone)]
pub enum ScriptedResult {
    Succeed {
        output: String,
        diff: Option<String>,
    },
    Fail {
        kind: AgentFailureKind,
        message: String,
    },
    /// Succeed, echoing the first line of the prompt into the output.
    Echo,
}

impl ScriptedResult {
    pub fn succeed(output: impl Into<String>) -> Self {
        Self::Succeed {
            output: output.into(),
            diff: None,
        }
    }

    pub fn succeed_with_diff(output: impl Into<String>, diff: impl Into<String>) -> Self {
        Self::Succeed {
            output: output.into(),
            diff: Some(diff.into()),
        }
    }

    pub fn fail(kind: AgentFailureKind, message: impl Into<String>) -> Self {
        Self::Fail {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

/// Deterministic in-process agent used by tests and `dry_run` mode.
///
/// Each `execute` call consumes the next queued behavior; when the queue is
/// empty the default behavior applies. The emitted stream follows the
/// contract: `Started`, a `Progress` tick, then `Completed` or `Error`.
/// Cancellation short-circuits the delay and terminates the stream with
/// `Error { kind: Canceled }`.
pub struct ScriptedAgent {
    name: String,
    capabilities: AgentCapabilities,
    default_behavior: ScriptedBehavior,
    queued: Mutex<VecDeque<ScriptedBehavior>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, default_behavior: ScriptedBehavior) -> Self {
        Self {
            name: name.into(),
            capabilities: AgentCapabilities::default(),
            default_behavior,
            queued: Mutex::new(VecDeque::new()),
        }
    }

    /// An agent that instantly succeeds, echoing the prompt's first line.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(
            name,
            ScriptedBehavior {
                delay: Duration::ZERO,
                result: ScriptedResult::Echo,
            },
        )
    }

    /// Queue a behavior for the next call; later calls fall back to the
    /// default. Useful for scripting fail-then-succeed retry sequences.
    pub fn push_behavior(&self, behavior: ScriptedBehavior) {
        self.queued
            .lock()
            .expect("scripted agent lock poisoned")
            .push_back(behavior);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_behavior(&self) -> ScriptedBehavior {
        self.queued
            .lock()
            .expect("scripted agent lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

#[async_trait]
impl AgentConnector for ScriptedAgent {
    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities.clone()
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> flume::Receiver<AgentEvent> {
        let behavior = self.next_behavior();
        let name = self.name.clone();
        let (tx, rx) = flume::bounded(16);

        tokio::spawn(async move {
            let _ = tx.send_async(AgentEvent::Started).await;

            tokio::select! {
                _ = tokio::time::sleep(behavior.delay) => {}
                _ = cancel.cancelled() => {
                    let _ = tx
                        .send_async(AgentEvent::Error {
                            kind: AgentFailureKind::Canceled,
                            message: "execution cancelled".to_string(),
                        })
                        .await;
                    return;
                }
            }

            let _ = tx
                .send_async(AgentEvent::Progress {
                    fraction: 1.0,
                    message: None,
                })
                .await;

            let terminal = match behavior.result {
                ScriptedResult::Succeed { output, diff } => AgentEvent::Completed {
                    output,
                    output_file: None,
                    diff,
                },
                ScriptedResult::Echo => {
                    let first_line = request.prompt.lines().next().unwrap_or("").to_string();
                    AgentEvent::Completed {
                        output: format!("[{name}] {first_line}"),
                        output_file: None,
                        diff: None,
                    }
                }
                ScriptedResult::Fail { kind, message } => AgentEvent::Error { kind, message },
            };
            let _ = tx.send_async(terminal).await;
        });

        rx
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
