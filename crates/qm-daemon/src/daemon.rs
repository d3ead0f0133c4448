use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use qm_agents::{AgentRegistry, ScriptedAgent};
use qm_bridge::{api_router, ApiState};
use qm_core::config::QuorumConfig;
use qm_core::store::WorkflowStore;
use qm_engine::{EngineContext, KanbanEngine, WorkflowEngine};
use qm_harness::ShutdownSignal;

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The quorum daemon: opens the store, recovers interrupted runs, wires the
/// engine, serves the HTTP API, and runs the kanban auto-engine loop until
/// shutdown.
pub struct Daemon {
    config: QuorumConfig,
    state: Arc<ApiState>,
    kanban: Arc<KanbanEngine>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create a daemon with the default registry: one scripted connector per
    /// configured agent. Integrations that spawn real agent CLIs use
    /// [`Daemon::with_registry`].
    pub async fn new(config: QuorumConfig) -> Result<Self> {
        let registry = build_default_registry(&config)?;
        Self::with_registry(config, registry).await
    }

    pub async fn with_registry(config: QuorumConfig, registry: AgentRegistry) -> Result<Self> {
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let store = WorkflowStore::open(data_dir.join("state.db"))
            .await
            .context("failed to open workflow store")?;
        let store = Arc::new(store);

        // Crash recovery: anything left running by a previous process failed.
        let recovered = store
            .recover_interrupted()
            .await
            .context("crash recovery failed")?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted workflows");
        }

        let ctx = EngineContext::new(config.clone(), store, Arc::new(registry));
        let engine = WorkflowEngine::new(ctx.clone());
        let kanban = Arc::new(KanbanEngine::new(ctx, engine.clone()));
        let state = Arc::new(ApiState::new(engine, kanban.clone()));

        Ok(Self {
            config,
            state,
            kanban,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    /// Handle for triggering shutdown from another task (signal handler).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the API on a pre-bound listener and run the kanban loop until
    /// the shutdown signal fires (blocking).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(self.state.clone());
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "API server listening");

        // The kanban loop doubles as the daemon's main loop; it exits on
        // shutdown.
        self.kanban.run(self.shutdown.clone()).await;

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    /// Bind from config and run (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }
}

/// One connector per configured agent name. The scripted connector stands in
/// until a real CLI adapter is registered for the name; it keeps `dry_run`
/// workflows and local development functional without any external tools.
fn build_default_registry(config: &QuorumConfig) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for (name, slots) in &config.agents.slots {
        registry
            .register(name, *slots, Arc::new(ScriptedAgent::echo(name)))
            .map_err(|e| anyhow::anyhow!("agent registration failed: {e}"))?;
    }
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_config(dir: &std::path::Path) -> QuorumConfig {
        let mut config = QuorumConfig::default();
        config.general.data_dir = dir.to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn daemon_serves_health_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(temp_config(dir.path())).await.unwrap();
        let shutdown = daemon.shutdown_handle();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let run = async { daemon.run_with_listener(listener).await };
        let probe = async {
            let client = reqwest::Client::new();
            // Retry until the server accepts connections.
            for _ in 0..100 {
                if let Ok(resp) = client.get(format!("http://{addr}/health")).send().await {
                    assert_eq!(resp.status(), 200);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            shutdown.trigger();
        };
        let (run_result, ()) = tokio::join!(run, probe);
        run_result.unwrap();
    }

    #[tokio::test]
    async fn startup_recovers_interrupted_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());

        // Seed a store with a workflow stuck in running.
        {
            let store = WorkflowStore::open(dir.path().join("state.db")).await.unwrap();
            let wf = qm_core::types::Workflow::new(
                "interrupted",
                None,
                qm_core::types::ExecutionConfig::default(),
            );
            store.create_workflow(&wf).await.unwrap();
            store
                .update_workflow(
                    &wf.id,
                    &qm_core::types::WorkflowPatch::status(
                        qm_core::types::WorkflowStatus::Running,
                    ),
                )
                .await
                .unwrap();
        }

        let daemon = Daemon::new(config).await.unwrap();
        let workflows = daemon
            .state
            .ctx()
            .store
            .list_workflows(&qm_core::types::WorkflowFilter::default())
            .await
            .unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(
            workflows[0].status,
            qm_core::types::WorkflowStatus::Failed
        );
        assert_eq!(workflows[0].error.as_deref(), Some("process restarted"));
    }

    #[tokio::test]
    async fn default_registry_follows_config_slots() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(temp_config(dir.path())).await.unwrap();
        let registry = &daemon.state.ctx().registry;
        assert_eq!(registry.slots("claude"), Some(2));
        assert_eq!(registry.slots("gemini"), Some(1));
        assert_eq!(registry.slots("codex"), Some(3));
    }
}
