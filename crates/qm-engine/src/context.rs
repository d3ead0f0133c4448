use std::sync::Arc;

use qm_agents::AgentRegistry;
use qm_core::artifacts::ArtifactStore;
use qm_core::config::{ConfigHandle, EngineConfig, QuorumConfig};
use qm_core::store::WorkflowStore;
use qm_core::{TaskId, WorkflowId};
use qm_events::{Event, EventBus, EventKind};

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// The immutable bundle of collaborators passed into every engine subsystem.
/// Hot-reloadable settings (agent limits, timeouts) go through the
/// [`ConfigHandle`] snapshot; everything else is fixed at construction.
#[derive(Clone)]
pub struct EngineContext {
    pub project_id: String,
    pub store: Arc<WorkflowStore>,
    pub artifacts: ArtifactStore,
    pub bus: EventBus,
    pub registry: Arc<AgentRegistry>,
    pub config: ConfigHandle,
}

impl EngineContext {
    pub fn new(
        config: QuorumConfig,
        store: Arc<WorkflowStore>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        let project_id = config.general.project_name.clone();
        let artifacts = ArtifactStore::new(config.data_dir());
        let bus = EventBus::new(project_id.clone());
        Self {
            project_id,
            store,
            artifacts,
            bus,
            registry,
            config: ConfigHandle::new(config),
        }
    }

    /// Current engine-section snapshot.
    pub fn engine_config(&self) -> EngineConfig {
        self.config.load().engine.clone()
    }

    pub fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    pub fn publish_workflow(
        &self,
        workflow_id: &WorkflowId,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        self.bus.publish(Event::for_workflow(
            self.project_id.clone(),
            workflow_id.clone(),
            kind,
            payload,
        ));
    }

    pub fn publish_task(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        agent: Option<&str>,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        let mut event = Event::for_task(
            self.project_id.clone(),
            workflow_id.clone(),
            task_id.clone(),
            kind,
            payload,
        );
        if let Some(agent) = agent {
            event = event.with_agent(agent);
        }
        self.bus.publish(event);
    }
}
