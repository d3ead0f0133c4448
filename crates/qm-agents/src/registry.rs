use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connector::{AgentCapabilities, AgentConnector, ExecuteRequest};
use crate::events::AgentEvent;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: `{0}`")]
    AgentNotFound(String),
    #[error("duplicate agent name: `{0}`")]
    DuplicateAgent(String),
    #[error("agent `{0}` has been shut down")]
    Closed(String),
}

// ---------------------------------------------------------------------------
// Registered agent
// ---------------------------------------------------------------------------

struct RegisteredAgent {
    connector: Arc<dyn AgentConnector>,
    semaphore: Arc<Semaphore>,
    slots: usize,
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Maps agent names to capability handles and enforces each agent's
/// concurrency quota with a weighted semaphore: admission to `execute`
/// acquires one slot, released when the returned stream terminates.
///
/// Registration happens once at startup; afterwards the registry is shared
/// immutably (`Arc<AgentRegistry>`).
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent with `slots` concurrent executions. Returns an
    /// error if the name is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        slots: usize,
        connector: Arc<dyn AgentConnector>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.agents.contains_key(&name) {
            return Err(RegistryError::DuplicateAgent(name));
        }
        let slots = slots.max(1);
        debug!(agent = %name, slots, "registered agent");
        self.agents.insert(
            name,
            RegisteredAgent {
                connector,
                semaphore: Arc::new(Semaphore::new(slots)),
                slots,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// All registered agent names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn capabilities(&self, name: &str) -> Option<AgentCapabilities> {
        self.agents.get(name).map(|a| a.connector.capabilities())
    }

    /// Configured slot count for an agent.
    pub fn slots(&self, name: &str) -> Option<usize> {
        self.agents.get(name).map(|a| a.slots)
    }

    /// Currently free slots for an agent.
    pub fn available(&self, name: &str) -> Option<usize> {
        self.agents.get(name).map(|a| a.semaphore.available_permits())
    }

    /// `free slots / total slots`, the scheduler's first tie-break key.
    /// Unknown agents rank last.
    pub fn free_ratio(&self, name: &str) -> f64 {
        match self.agents.get(name) {
            Some(a) => a.semaphore.available_permits() as f64 / a.slots as f64,
            None => 0.0,
        }
    }

    /// `true` when the agent could start an execution right now.
    pub fn has_capacity(&self, name: &str) -> bool {
        self.available(name).map(|n| n > 0).unwrap_or(false)
    }

    /// Try to take one slot of the named agent without waiting.
    ///
    /// Returns `None` when the agent is at capacity. An agent name the
    /// registry does not know yields an unmetered permit: the scheduler may
    /// dispatch it and the execution path reports the missing agent itself.
    pub fn try_acquire(&self, name: &str) -> Option<AgentPermit> {
        match self.agents.get(name) {
            Some(agent) => agent
                .semaphore
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| AgentPermit {
                    permit: Some(permit),
                }),
            None => Some(AgentPermit { permit: None }),
        }
    }

    /// Execute a request on the named agent.
    ///
    /// Waits for a free slot, invokes the connector, and returns the event
    /// stream. The slot is held by a forwarding task and released exactly
    /// when the stream terminates — completed, failed, or cancelled —
    /// including when the caller drops the receiver early.
    pub async fn execute(
        &self,
        name: &str,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<AgentRun, RegistryError> {
        let agent = self
            .agents
            .get(name)
            .ok_or_else(|| RegistryError::AgentNotFound(name.to_string()))?;

        let permit = agent
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RegistryError::Closed(name.to_string()))?;

        self.run_with_permit(
            name,
            AgentPermit {
                permit: Some(permit),
            },
            request,
            cancel,
        )
        .await
    }

    /// Execute a request without acquiring a slot here. Used by the DAG
    /// scheduler, whose dispatcher already holds the slot (taken via
    /// [`try_acquire`]) for the whole attempt.
    pub async fn execute_unmetered(
        &self,
        name: &str,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<AgentRun, RegistryError> {
        self.run_with_permit(name, AgentPermit { permit: None }, request, cancel)
            .await
    }

    async fn run_with_permit(
        &self,
        name: &str,
        permit: AgentPermit,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<AgentRun, RegistryError> {
        let agent = self
            .agents
            .get(name)
            .ok_or_else(|| RegistryError::AgentNotFound(name.to_string()))?;

        let upstream = agent.connector.execute(request, cancel).await;
        let (tx, rx) = flume::bounded(64);
        let agent_name = name.to_string();

        // Forward until the connector closes its stream; the permit lives in
        // this task and is released on every exit path.
        tokio::spawn(async move {
            let _permit = permit;
            while let Ok(event) = upstream.recv_async().await {
                if tx.send_async(event).await.is_err() {
                    // Receiver gone; drain the connector so it can finish.
                    while upstream.recv_async().await.is_ok() {}
                    break;
                }
            }
            debug!(agent = %agent_name, "agent stream terminated, slot released");
        });

        Ok(AgentRun {
            agent: name.to_string(),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// AgentPermit
// ---------------------------------------------------------------------------

/// One held concurrency slot. Dropping it releases the slot. Permits for
/// agents the registry does not meter hold nothing.
pub struct AgentPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl AgentPermit {
    pub fn is_metered(&self) -> bool {
        self.permit.is_some()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// AgentRun
// ---------------------------------------------------------------------------

/// A live agent execution: the receiving end of its event stream.
pub struct AgentRun {
    pub agent: String,
    pub events: flume::Receiver<AgentEvent>,
}

impl AgentRun {
    /// Drain the stream to its terminal event.
    pub async fn wait(self) -> Option<AgentEvent> {
        let mut last = None;
        while let Ok(event) = self.events.recv_async().await {
            let terminal = event.is_terminal();
            last = Some(event);
            if terminal {
                break;
            }
        }
        last
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedAgent, ScriptedBehavior, ScriptedResult};
    use std::time::Duration;

    fn echo_registry(slots: usize) -> AgentRegistry {
        let mut reg = AgentRegistry::new();
        reg.register("claude", slots, Arc::new(ScriptedAgent::echo("claude")))
            .unwrap();
        reg
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = echo_registry(2);
        let err = reg
            .register("claude", 2, Arc::new(ScriptedAgent::echo("claude")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn unknown_agent_is_an_error() {
        let reg = echo_registry(1);
        let err = reg
            .execute(
                "gpt",
                ExecuteRequest::new("hi", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn stream_is_prefix_ordered() {
        let reg = echo_registry(1);
        let run = reg
            .execute(
                "claude",
                ExecuteRequest::new("say hello", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = run.events.recv_async().await {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(AgentEvent::Started)));
        assert!(matches!(events.last(), Some(AgentEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn slot_count_is_never_exceeded() {
        let mut reg = AgentRegistry::new();
        let agent = ScriptedAgent::new(
            "gemini",
            ScriptedBehavior {
                delay: Duration::from_millis(50),
                result: ScriptedResult::succeed("ok"),
            },
        );
        reg.register("gemini", 1, Arc::new(agent)).unwrap();
        let reg = Arc::new(reg);

        assert_eq!(reg.available("gemini"), Some(1));
        let run1 = reg
            .execute(
                "gemini",
                ExecuteRequest::new("a", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reg.available("gemini"), Some(0));
        assert!(!reg.has_capacity("gemini"));

        // Second execute must wait for the first stream to finish.
        let reg2 = reg.clone();
        let second = tokio::spawn(async move {
            reg2.execute(
                "gemini",
                ExecuteRequest::new("b", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .wait()
            .await
        });

        let first = run1.wait().await;
        assert!(matches!(first, Some(AgentEvent::Completed { .. })));

        let second = second.await.unwrap();
        assert!(matches!(second, Some(AgentEvent::Completed { .. })));

        // The permit is dropped by the forwarding task shortly after the
        // terminal event; poll rather than race it.
        for _ in 0..100 {
            if reg.available("gemini") == Some(1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("gemini slot was never released");
    }

    #[tokio::test]
    async fn cancel_releases_the_slot() {
        let mut reg = AgentRegistry::new();
        let agent = ScriptedAgent::new(
            "claude",
            ScriptedBehavior {
                delay: Duration::from_secs(30),
                result: ScriptedResult::succeed("never"),
            },
        );
        reg.register("claude", 1, Arc::new(agent)).unwrap();

        let cancel = CancellationToken::new();
        let run = reg
            .execute(
                "claude",
                ExecuteRequest::new("long", Duration::from_secs(60)),
                cancel.clone(),
            )
            .await
            .unwrap();
        cancel.cancel();

        let last = run.wait().await;
        assert!(
            matches!(
                last,
                Some(AgentEvent::Error {
                    kind: qm_core::types::AgentFailureKind::Canceled,
                    ..
                })
            ),
            "expected canceled error, got {last:?}"
        );
        // Slot comes back once the forwarding task observes the close.
        for _ in 0..100 {
            if reg.available("claude") == Some(1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("claude slot was never released");
    }
}
