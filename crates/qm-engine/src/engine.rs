use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use qm_core::store::StoreError;
use qm_core::types::{
    ExecutionConfig, KanbanColumn, Phase, Workflow, WorkflowPatch, WorkflowStatus,
};
use qm_core::{ErrorKind, QuorumError, WorkflowId};
use qm_events::EventKind;

use crate::context::EngineContext;
use crate::pipeline::Pipeline;

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// The cancellation scope and pause flag of one running phase sequence.
#[derive(Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
}

impl ActiveRun {
    fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause_tx,
        }
    }

    fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }
}

/// Per-workflow control entry: an op lock serializing control operations and
/// the currently active run, if any. At most one phase sequence runs per
/// workflow at a time.
struct ControlEntry {
    op_lock: tokio::sync::Mutex<()>,
    active: std::sync::Mutex<Option<ActiveRun>>,
}

impl ControlEntry {
    fn new() -> Self {
        Self {
            op_lock: tokio::sync::Mutex::new(()),
            active: std::sync::Mutex::new(None),
        }
    }

    fn active_run(&self) -> Option<ActiveRun> {
        self.active.lock().expect("control lock poisoned").clone()
    }

    fn set_active(&self, run: ActiveRun) {
        *self.active.lock().expect("control lock poisoned") = Some(run);
    }

    fn clear_active(&self) {
        *self.active.lock().expect("control lock poisoned") = None;
    }
}

// ---------------------------------------------------------------------------
// Control operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlOp {
    Start,
    Analyze,
    Plan,
    Execute,
    Replan,
}

impl ControlOp {
    fn phases(&self) -> &'static [Phase] {
        match self {
            ControlOp::Start => Phase::pipeline_order(),
            ControlOp::Analyze => &[Phase::Refine, Phase::Analyze],
            ControlOp::Plan | ControlOp::Replan => &[Phase::Plan],
            ControlOp::Execute => &[Phase::Execute],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ControlOp::Start => "start",
            ControlOp::Analyze => "analyze",
            ControlOp::Plan => "plan",
            ControlOp::Execute => "execute",
            ControlOp::Replan => "replan",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Owns the workflow lifecycle state machine: accepts control operations,
/// drives the phase pipeline, and publishes every transition. Control
/// operations on one workflow are serialized by a per-workflow mutex;
/// different workflows run concurrently.
#[derive(Clone)]
pub struct WorkflowEngine {
    ctx: EngineContext,
    pipeline: Pipeline,
    controls: Arc<DashMap<WorkflowId, Arc<ControlEntry>>>,
}

impl WorkflowEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let pipeline = Pipeline::new(ctx.clone());
        Self {
            ctx,
            pipeline,
            controls: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    fn entry(&self, id: &WorkflowId) -> Arc<ControlEntry> {
        self.controls
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ControlEntry::new()))
            .clone()
    }

    async fn require(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        self.ctx
            .store
            .get_workflow(id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| QuorumError::not_found(format!("workflow {id}")))
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub async fn create_workflow(
        &self,
        prompt: impl Into<String>,
        title: Option<String>,
        config: Option<ExecutionConfig>,
    ) -> Result<Workflow, QuorumError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(QuorumError::validation("prompt must not be empty"));
        }
        let wf = Workflow::new(prompt, title, config.unwrap_or_default());
        self.ctx.store.create_workflow(&wf).await.map_err(store_err)?;
        self.ctx.publish_workflow(
            &wf.id,
            EventKind::WorkflowCreated,
            serde_json::json!({ "title": wf.title }),
        );
        info!(workflow_id = %wf.id, "workflow created");
        Ok(wf)
    }

    /// Apply a metadata patch (title, config, kanban column). Column moves
    /// publish `kanban.moved`.
    pub async fn patch_workflow(
        &self,
        id: &WorkflowId,
        patch: WorkflowPatch,
    ) -> Result<Workflow, QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;
        let before = self.require(id).await?;
        let updated = self
            .ctx
            .store
            .update_workflow(id, &patch)
            .await
            .map_err(store_err)?;
        if updated.kanban_column != before.kanban_column {
            self.ctx.publish_workflow(
                id,
                EventKind::KanbanMoved,
                serde_json::json!({
                    "from": before.kanban_column.as_str(),
                    "to": updated.kanban_column.as_str(),
                }),
            );
        }
        Ok(updated)
    }

    /// Delete a workflow; rejected with `conflict` while running. On-disk
    /// artifacts are kept.
    pub async fn delete_workflow(&self, id: &WorkflowId) -> Result<(), QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;
        self.ctx.store.delete_workflow(id).await.map_err(store_err)?;
        self.controls.remove(id);
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase control operations
    // -----------------------------------------------------------------------

    pub async fn start(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        self.launch(id, ControlOp::Start, None).await
    }

    pub async fn analyze(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        self.launch(id, ControlOp::Analyze, None).await
    }

    pub async fn plan(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        self.launch(id, ControlOp::Plan, None).await
    }

    pub async fn execute(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        self.launch(id, ControlOp::Execute, None).await
    }

    pub async fn replan(&self, id: &WorkflowId, note: &str) -> Result<Workflow, QuorumError> {
        self.launch(id, ControlOp::Replan, Some(note.to_string())).await
    }

    /// Kanban auto-engine entry point: run the full phase sequence inline
    /// and return the workflow's terminal status.
    pub async fn start_blocking(&self, id: &WorkflowId) -> Result<WorkflowStatus, QuorumError> {
        let (active, phases) = self.begin(id, ControlOp::Start, &None).await?;
        Ok(self.run_phases(id.clone(), phases, None, active).await)
    }

    /// Validate, flip to running, register the active run, and spawn the
    /// phase runner.
    async fn launch(
        &self,
        id: &WorkflowId,
        op: ControlOp,
        note: Option<String>,
    ) -> Result<Workflow, QuorumError> {
        let (active, phases) = self.begin(id, op, &note).await?;
        let engine = self.clone();
        let wf_id = id.clone();
        tokio::spawn(async move {
            engine.run_phases(wf_id, phases, note, active).await;
        });
        self.require(id).await
    }

    async fn begin(
        &self,
        id: &WorkflowId,
        op: ControlOp,
        _note: &Option<String>,
    ) -> Result<(ActiveRun, &'static [Phase]), QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;

        if entry.active_run().is_some() {
            return Err(QuorumError::conflict(format!(
                "workflow {id} already has a running phase"
            )));
        }
        let wf = self.require(id).await?;
        validate_op(&wf, op)?;

        let active = ActiveRun::new();
        entry.set_active(active.clone());
        let flipped = self
            .set_status(
                id,
                WorkflowPatch {
                    status: Some(WorkflowStatus::Running),
                    started_at: wf.started_at.is_none().then(Utc::now),
                    ..WorkflowPatch::default()
                }
                .clearing_error(),
            )
            .await;
        if let Err(e) = flipped {
            entry.clear_active();
            return Err(e);
        }
        info!(workflow_id = %id, op = op.name(), "phase run starting");
        Ok((active, op.phases()))
    }

    /// Drive the phases in order; each phase gets the phase deadline as a
    /// child of the run's cancellation scope.
    async fn run_phases(
        &self,
        id: WorkflowId,
        phases: &'static [Phase],
        note: Option<String>,
        active: ActiveRun,
    ) -> WorkflowStatus {
        let mut outcome = WorkflowStatus::Completed;

        for phase in phases {
            self.ctx.publish_workflow(
                &id,
                EventKind::WorkflowPhaseStarted,
                serde_json::json!({ "phase": phase.as_str() }),
            );
            if let Err(e) = self
                .ctx
                .store
                .update_workflow(&id, &WorkflowPatch::default().with_phase(*phase))
                .await
            {
                error!(workflow_id = %id, error = %e, "failed to persist phase");
            }

            match self.run_single_phase(&id, *phase, note.as_deref(), &active).await {
                Ok(()) => {
                    self.ctx.publish_workflow(
                        &id,
                        EventKind::WorkflowPhaseCompleted,
                        serde_json::json!({ "phase": phase.as_str() }),
                    );
                }
                Err(err) => {
                    outcome = if active.cancel.is_cancelled() || err.kind == ErrorKind::Canceled {
                        WorkflowStatus::Stopped
                    } else {
                        WorkflowStatus::Failed
                    };
                    let patch = WorkflowPatch {
                        finished_at: Some(Utc::now()),
                        status: Some(outcome),
                        ..WorkflowPatch::default()
                    }
                    .with_error(err.to_string());
                    if let Err(e) = self.set_status(&id, patch).await {
                        error!(workflow_id = %id, error = %e, "failed to persist failure");
                    }
                    if outcome == WorkflowStatus::Failed {
                        self.ctx.publish_workflow(
                            &id,
                            EventKind::WorkflowError,
                            serde_json::to_value(&err).unwrap_or_default(),
                        );
                    }
                    self.entry(&id).clear_active();
                    return outcome;
                }
            }
        }

        let patch = WorkflowPatch {
            status: Some(WorkflowStatus::Completed),
            finished_at: Some(Utc::now()),
            ..WorkflowPatch::default()
        };
        if let Err(e) = self.set_status(&id, patch).await {
            error!(workflow_id = %id, error = %e, "failed to persist completion");
        }
        self.entry(&id).clear_active();
        info!(workflow_id = %id, "phase run completed");
        outcome
    }

    async fn run_single_phase(
        &self,
        id: &WorkflowId,
        phase: Phase,
        note: Option<&str>,
        active: &ActiveRun,
    ) -> Result<(), QuorumError> {
        // Re-read so later phases see the refined prompt and fresh config.
        let wf = self.require(id).await?;
        let phase_timeout =
            Duration::from_secs(self.ctx.engine_config().phase_timeout_s.max(1));

        let work = async {
            match phase {
                Phase::Refine => {
                    let refined = self.pipeline.run_refine(&wf, &active.cancel).await?;
                    self.ctx
                        .store
                        .update_workflow(
                            id,
                            &WorkflowPatch {
                                optimized_prompt: Some(refined),
                                ..WorkflowPatch::default()
                            },
                        )
                        .await
                        .map_err(store_err)?;
                    Ok(())
                }
                Phase::Analyze => self.pipeline.run_analyze(&wf, &active.cancel).await,
                Phase::Plan => {
                    if note.is_some() {
                        // Replanning: the execute phase's results are stale.
                        self.ctx
                            .artifacts
                            .discard_phase(id, Phase::Execute)
                            .await
                            .map_err(|e| QuorumError::internal(e.to_string()))?;
                    }
                    self.pipeline.run_plan(&wf, &active.cancel, note).await.map(|_| ())
                }
                Phase::Execute => {
                    let summary = self
                        .pipeline
                        .run_execute(&wf, &active.cancel, active.pause_rx())
                        .await?;
                    if summary.canceled {
                        Err(QuorumError::canceled("execution stopped"))
                    } else if summary.all_completed() {
                        Ok(())
                    } else {
                        let failed = summary
                            .statuses
                            .values()
                            .filter(|s| **s != qm_core::types::TaskStatus::Completed)
                            .count();
                        Err(QuorumError::new(
                            ErrorKind::AgentError,
                            format!("{failed} of {} tasks did not complete", summary.statuses.len()),
                        ))
                    }
                }
            }
        };
        tokio::pin!(work);

        // Phase deadline: expiry cancels the scope, then the phase is given
        // time to drain before the timeout error is surfaced.
        tokio::select! {
            result = &mut work => result.map_err(|e| e.with_phase(phase)),
            _ = tokio::time::sleep(phase_timeout) => {
                active.cancel.cancel();
                let _ = work.await;
                Err(QuorumError::timeout(format!(
                    "phase {phase} exceeded {}s", phase_timeout.as_secs()
                ))
                .with_phase(phase))
            }
        }
    }

    // -----------------------------------------------------------------------
    // pause / resume / stop
    // -----------------------------------------------------------------------

    /// Stop dispatching new tasks; in-flight tasks run to completion.
    pub async fn pause(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;
        let wf = self.require(id).await?;
        if wf.status != WorkflowStatus::Running {
            return Err(QuorumError::conflict(format!(
                "cannot pause workflow in status {}",
                wf.status.as_str()
            )));
        }
        let active = entry
            .active_run()
            .ok_or_else(|| QuorumError::conflict("workflow has no active run"))?;
        let _ = active.pause_tx.send(true);
        self.set_status(id, WorkflowPatch::status(WorkflowStatus::Paused)).await?;
        self.require(id).await
    }

    pub async fn resume(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;
        let wf = self.require(id).await?;
        if wf.status != WorkflowStatus::Paused {
            return Err(QuorumError::conflict(format!(
                "cannot resume workflow in status {}",
                wf.status.as_str()
            )));
        }
        let active = entry
            .active_run()
            .ok_or_else(|| QuorumError::conflict("workflow has no active run"))?;
        let _ = active.pause_tx.send(false);
        self.set_status(id, WorkflowPatch::status(WorkflowStatus::Running)).await?;
        self.require(id).await
    }

    /// Cancel the run; the workflow transitions to `stopped` once the
    /// scheduler drains.
    pub async fn stop(&self, id: &WorkflowId) -> Result<Workflow, QuorumError> {
        let entry = self.entry(id);
        let _guard = entry.op_lock.lock().await;
        let wf = self.require(id).await?;
        if wf.status != WorkflowStatus::Running && wf.status != WorkflowStatus::Paused {
            return Err(QuorumError::conflict(format!(
                "cannot stop workflow in status {}",
                wf.status.as_str()
            )));
        }
        match entry.active_run() {
            Some(active) => {
                // Make sure a paused scheduler still drains promptly.
                let _ = active.pause_tx.send(false);
                active.cancel.cancel();
            }
            None => {
                // No live run to drain (e.g. state left over from a crash).
                self.set_status(
                    id,
                    WorkflowPatch {
                        status: Some(WorkflowStatus::Stopped),
                        finished_at: Some(Utc::now()),
                        ..WorkflowPatch::default()
                    },
                )
                .await?;
            }
        }
        info!(workflow_id = %id, "stop requested");
        self.require(id).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Persist a status patch, then publish the change — in that order.
    async fn set_status(&self, id: &WorkflowId, patch: WorkflowPatch) -> Result<(), QuorumError> {
        let status = patch.status;
        let updated = self
            .ctx
            .store
            .update_workflow(id, &patch)
            .await
            .map_err(store_err)?;
        if status.is_some() {
            self.ctx.publish_workflow(
                id,
                EventKind::WorkflowStatusChanged,
                serde_json::json!({
                    "status": updated.status.as_str(),
                    "phase": updated.current_phase.map(|p| p.as_str()),
                }),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_op(wf: &Workflow, op: ControlOp) -> Result<(), QuorumError> {
    let ok = match op {
        ControlOp::Start | ControlOp::Analyze => wf.status == WorkflowStatus::Pending,
        ControlOp::Plan => {
            wf.status == WorkflowStatus::Completed && wf.current_phase == Some(Phase::Analyze)
        }
        ControlOp::Execute => {
            wf.status == WorkflowStatus::Completed && wf.current_phase == Some(Phase::Plan)
        }
        ControlOp::Replan => {
            wf.status == WorkflowStatus::Completed
                && matches!(wf.current_phase, Some(Phase::Plan) | Some(Phase::Execute))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(QuorumError::conflict(format!(
            "cannot {} workflow {} in status {} (phase {:?})",
            op.name(),
            wf.id,
            wf.status.as_str(),
            wf.current_phase.map(|p| p.as_str()),
        )))
    }
}

fn store_err(e: StoreError) -> QuorumError {
    match e {
        StoreError::NotFound(msg) => QuorumError::not_found(msg),
        StoreError::Conflict(msg) => QuorumError::conflict(msg),
        other => QuorumError::internal(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// kanban helpers used by the auto-engine and the board API
// ---------------------------------------------------------------------------

impl WorkflowEngine {
    /// Move a workflow to a kanban column (persist, then publish).
    pub async fn move_to_column(
        &self,
        id: &WorkflowId,
        column: KanbanColumn,
    ) -> Result<Workflow, QuorumError> {
        self.patch_workflow(id, WorkflowPatch::column(column)).await
    }
}
