use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use qm_core::types::{KanbanColumn, WorkflowFilter, WorkflowStatus};
use qm_core::{QuorumError, WorkflowId};
use qm_events::EventKind;
use qm_harness::{CircuitBreaker, ShutdownSignal};

use crate::context::EngineContext;
use crate::engine::WorkflowEngine;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KanbanEngineStatus {
    pub enabled: bool,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// KanbanEngine
// ---------------------------------------------------------------------------

/// Optional background loop that feeds `todo` workflows into the workflow
/// engine, oldest first, moving them across the board as they run. A
/// consecutive-failure circuit breaker halts the loop until an explicit
/// reset.
pub struct KanbanEngine {
    ctx: EngineContext,
    engine: WorkflowEngine,
    breaker: CircuitBreaker,
    enabled: AtomicBool,
    poll_interval: Duration,
}

impl KanbanEngine {
    pub fn new(ctx: EngineContext, engine: WorkflowEngine) -> Self {
        let cfg = ctx.config.load().kanban.clone();
        Self {
            ctx,
            engine,
            breaker: CircuitBreaker::new(cfg.failure_threshold),
            enabled: AtomicBool::new(cfg.auto_enabled),
            poll_interval: Duration::from_secs(cfg.poll_interval_s.max(1)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::Relaxed) {
            info!("kanban auto-engine enabled");
            self.publish_state(true);
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            info!("kanban auto-engine disabled");
            self.publish_state(false);
        }
    }

    /// Close the circuit breaker again after operator intervention.
    pub async fn reset(&self) {
        self.breaker.reset().await;
        self.ctx
            .bus
            .broadcast_typed(EventKind::KanbanCircuitBreakerReset, serde_json::json!({}));
    }

    pub async fn status(&self) -> KanbanEngineStatus {
        KanbanEngineStatus {
            enabled: self.is_enabled(),
            circuit_open: self.breaker.is_open().await,
            consecutive_failures: self.breaker.consecutive_failures().await,
        }
    }

    fn publish_state(&self, enabled: bool) {
        self.ctx.bus.broadcast_typed(
            EventKind::KanbanEngineStateChanged,
            serde_json::json!({ "enabled": enabled }),
        );
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Poll loop; runs until the shutdown signal fires.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.is_enabled() && !self.breaker.is_open().await {
                        self.tick().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("kanban auto-engine stopping");
                    break;
                }
            }
        }
    }

    /// One poll: pick the oldest pending `todo` workflow and drive it
    /// through the full phase sequence. Returns the picked workflow id.
    pub async fn tick(&self) -> Option<WorkflowId> {
        let filter = WorkflowFilter {
            status: Some(WorkflowStatus::Pending),
            kanban_column: Some(KanbanColumn::Todo),
            ..WorkflowFilter::default()
        };
        // The store lists newest first; the auto-engine wants the oldest.
        let candidates = match self.ctx.store.list_workflows(&filter).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "kanban tick: listing workflows failed");
                return None;
            }
        };
        let wf = candidates.into_iter().last()?;
        let id = wf.id.clone();
        info!(workflow_id = %id, "kanban auto-engine picked workflow");

        if let Err(e) = self.engine.move_to_column(&id, KanbanColumn::InProgress).await {
            warn!(workflow_id = %id, error = %e, "kanban tick: move to in_progress failed");
            return None;
        }

        match self.engine.start_blocking(&id).await {
            Ok(WorkflowStatus::Completed) => {
                let _ = self.engine.move_to_column(&id, KanbanColumn::ToVerify).await;
                self.breaker.record_success().await;
            }
            outcome => {
                if let Err(e) = &outcome {
                    warn!(workflow_id = %id, error = %e, "kanban tick: start failed");
                }
                let _ = self.engine.move_to_column(&id, KanbanColumn::Todo).await;
                self.record_failure().await;
            }
        }
        Some(id)
    }

    async fn record_failure(&self) {
        if self.breaker.record_failure().await {
            let failures = self.breaker.consecutive_failures().await;
            warn!(failures, "kanban circuit breaker opened");
            self.ctx.bus.broadcast_typed(
                EventKind::KanbanCircuitBreakerOpened,
                serde_json::json!({ "consecutive_failures": failures }),
            );
        }
    }
}
