use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use qm_agents::{AgentEvent, ExecuteRequest};
use qm_core::artifacts::ArtifactStore;
use qm_core::types::{
    AgentFailureKind, ExecutionMode, Phase, Task, TaskPatch, TaskStatus, Workflow,
};
use qm_core::{QuorumError, TaskId, WorkflowId};
use qm_events::EventKind;

use crate::consensus::{consensus_reached, ConsensusPolicy, JaccardConsensus};
use crate::context::EngineContext;
use crate::graph::{TaskGraph, TaskSpec};
use crate::plan::{self, PlanTask};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::scheduler::{
    DagScheduler, RetryPolicy, RunContext, RunSummary, TaskExecutor, TaskNotice, TaskOutcome,
    TaskTransition,
};

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The refine -> analyze -> plan -> execute phase pipeline. Each phase is a
/// small DAG of agent calls producing artifacts; execute runs the planned
/// task graph through the DAG scheduler.
#[derive(Clone)]
pub struct Pipeline {
    ctx: EngineContext,
    consensus: Arc<dyn ConsensusPolicy>,
}

impl Pipeline {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            consensus: Arc::new(JaccardConsensus),
        }
    }

    /// Swap the consensus predicate (the default is word-set Jaccard).
    pub fn with_consensus(mut self, policy: Arc<dyn ConsensusPolicy>) -> Self {
        self.consensus = policy;
        self
    }

    // -----------------------------------------------------------------------
    // Agent selection
    // -----------------------------------------------------------------------

    /// The agent driving single-agent work: the configured one, else
    /// `claude` when registered, else the first registered agent.
    fn lead_agent(&self, wf: &Workflow) -> Result<String, QuorumError> {
        if let Some(name) = &wf.config.single_agent_name {
            return Ok(name.clone());
        }
        if self.ctx.registry.contains("claude") {
            return Ok("claude".to_string());
        }
        self.ctx
            .registry
            .names()
            .first()
            .map(|s| s.to_string())
            .ok_or_else(|| QuorumError::internal("no agents registered"))
    }

    /// The agents participating in a multi-agent analysis round.
    fn participants(&self, wf: &Workflow) -> Result<Vec<String>, QuorumError> {
        match wf.config.execution_mode {
            ExecutionMode::SingleAgent => Ok(vec![self.lead_agent(wf)?]),
            ExecutionMode::MultiAgent => {
                let names: Vec<String> =
                    self.ctx.registry.names().iter().map(|s| s.to_string()).collect();
                if names.is_empty() {
                    return Err(QuorumError::internal("no agents registered"));
                }
                Ok(names)
            }
        }
    }

    fn task_timeout(&self, wf: &Workflow) -> Duration {
        Duration::from_secs(wf.config.timeout_s.max(1))
    }

    /// Build the execute request for a phase-level agent call: configured
    /// model per agent, with the workflow's single-agent model/reasoning
    /// overrides applied when they target this agent.
    fn phase_request(&self, wf: &Workflow, agent: &str, prompt: String) -> ExecuteRequest {
        let models = self.ctx.config.load().agents.models.clone();
        let mut request =
            ExecuteRequest::new(prompt, self.task_timeout(wf)).with_model(models.get(agent).cloned());
        if wf.config.single_agent_name.as_deref() == Some(agent) {
            if wf.config.single_agent_model.is_some() {
                request.model = wf.config.single_agent_model.clone();
            }
            request.reasoning_effort = wf.config.single_agent_reasoning_effort.clone();
        }
        request
    }

    // -----------------------------------------------------------------------
    // refine
    // -----------------------------------------------------------------------

    /// Single-agent prompt refinement. Idempotent: re-running overwrites the
    /// refined prompt artifact. Returns the optimized prompt.
    pub async fn run_refine(
        &self,
        wf: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<String, QuorumError> {
        self.write_overwrite(&wf.id, "analyze-phase/00-original-prompt.md", wf.prompt.as_bytes())
            .await
            .map_err(|e| e.with_phase(Phase::Refine))?;

        let agent = self.lead_agent(wf)?;
        let prompt = format!(
            "Rewrite the following request as a precise, self-contained engineering \
             prompt. Keep every stated constraint, make implicit requirements \
             explicit, and drop filler.\n\n{}",
            wf.prompt
        );
        let request = self.phase_request(wf, &agent, prompt);
        let outcome = self
            .call_agent(&wf.id, None, &agent, request, cancel, true, None)
            .await
            .map_err(|e| e.with_phase(Phase::Refine))?;

        self.write_overwrite(
            &wf.id,
            "analyze-phase/01-refined-prompt.md",
            outcome.output.as_bytes(),
        )
        .await
        .map_err(|e| e.with_phase(Phase::Refine))?;

        Ok(outcome.output)
    }

    // -----------------------------------------------------------------------
    // analyze
    // -----------------------------------------------------------------------

    /// Multi-agent mode: bounded analysis rounds with an early stop on
    /// consensus, then a moderator consolidation. Single-agent mode: one
    /// analysis document.
    pub async fn run_analyze(
        &self,
        wf: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<(), QuorumError> {
        let subject = wf.optimized_prompt.as_deref().unwrap_or(&wf.prompt);

        if wf.config.execution_mode == ExecutionMode::SingleAgent {
            let agent = self.lead_agent(wf)?;
            let prompt = format!(
                "Analyze the following task. Cover affected components, risks, \
                 and a recommended approach.\n\n{subject}"
            );
            let request = self.phase_request(wf, &agent, prompt);
            let outcome = self
                .call_agent(&wf.id, None, &agent, request, cancel, true, None)
                .await
                .map_err(|e| e.with_phase(Phase::Analyze))?;
            self.write_overwrite(
                &wf.id,
                "analyze-phase/single-agent/analysis.md",
                outcome.output.as_bytes(),
            )
            .await
            .map_err(|e| e.with_phase(Phase::Analyze))?;
            return Ok(());
        }

        let participants = self.participants(wf)?;
        let rounds = wf.config.analysis_rounds.max(1);
        let threshold = wf.config.consensus_threshold;
        let mut drafts: Vec<String> = Vec::new();

        for _ in 0..rounds {
            let round = self
                .ctx
                .artifacts
                .next_round(&wf.id, "analyze-phase")
                .await
                .map_err(|e| QuorumError::internal(e.to_string()).with_phase(Phase::Analyze))?;

            let mut round_prompt = format!(
                "Analyze the following task. Cover affected components, risks, \
                 and a recommended approach.\n\n{subject}"
            );
            if !drafts.is_empty() {
                round_prompt.push_str(
                    "\n\nPrevious round drafts (converge where you agree, argue where \
                     you do not):\n",
                );
                for draft in &drafts {
                    round_prompt.push_str("\n---\n");
                    round_prompt.push_str(draft);
                }
            }

            let calls = participants.iter().map(|agent| {
                let request = self.phase_request(wf, agent, round_prompt.clone());
                let agent = agent.clone();
                async move {
                    let outcome = self
                        .call_agent(&wf.id, None, &agent, request, cancel, true, None)
                        .await?;
                    Ok::<(String, TaskOutcome), QuorumError>((agent, outcome))
                }
            });
            let results = futures_util::future::join_all(calls).await;

            drafts.clear();
            for result in results {
                let (agent, outcome) = result.map_err(|e| e.with_phase(Phase::Analyze))?;
                self.write_once(
                    &wf.id,
                    &format!("analyze-phase/v{round}/{agent}.md"),
                    outcome.output.as_bytes(),
                )
                .await
                .map_err(|e| e.with_phase(Phase::Analyze))?;
                drafts.push(outcome.output);
            }

            if consensus_reached(self.consensus.as_ref(), &drafts, threshold) {
                info!(workflow_id = %wf.id, round, "analysis consensus reached");
                break;
            }
        }

        // Moderator pass consolidates the final round.
        let moderator = self.lead_agent(wf)?;
        let mut prompt = format!(
            "You are the moderator. Consolidate the analysis drafts below into a \
             single document: agreed findings first, then disagreements with a \
             resolution for each.\n\nTask:\n{subject}\n"
        );
        for draft in &drafts {
            prompt.push_str("\n---\n");
            prompt.push_str(draft);
        }
        let request = self.phase_request(wf, &moderator, prompt);
        let outcome = self
            .call_agent(&wf.id, None, &moderator, request, cancel, true, None)
            .await
            .map_err(|e| e.with_phase(Phase::Analyze))?;
        self.write_overwrite(&wf.id, "analyze-phase/consolidated.md", outcome.output.as_bytes())
            .await
            .map_err(|e| e.with_phase(Phase::Analyze))?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // plan
    // -----------------------------------------------------------------------

    /// Run the plan phase: one agent emits the plan document with the
    /// machine-readable task list, which is parsed, written to artifacts,
    /// and loaded into the store as the new task DAG. Unparsable output is
    /// fatal (`plan_parse_error`).
    pub async fn run_plan(
        &self,
        wf: &Workflow,
        cancel: &CancellationToken,
        replan_note: Option<&str>,
    ) -> Result<Vec<Task>, QuorumError> {
        let subject = wf.optimized_prompt.as_deref().unwrap_or(&wf.prompt);
        let planner = self.lead_agent(wf)?;
        let agents = self.participants(wf)?;

        let mut prompt = format!(
            "Produce an execution plan for the task below. Break it into tasks \
             and emit each task as a fenced ```json block with exactly these \
             fields: id, name, agent, depends_on, timeout_s. Dependencies must \
             form a DAG. Available agents: {}.\n\nTask:\n{subject}\n",
            agents.join(", ")
        );
        if let Ok(analysis) = self
            .ctx
            .artifacts
            .read_to_string(&wf.id, "analyze-phase/consolidated.md")
            .await
        {
            prompt.push_str("\nConsolidated analysis:\n");
            prompt.push_str(&analysis);
        }
        if let Some(note) = replan_note {
            prompt.push_str("\nRe-planning context from the user:\n");
            prompt.push_str(note);
        }

        let request = self.phase_request(wf, &planner, prompt);
        let outcome = self
            .call_agent(&wf.id, None, &planner, request, cancel, true, None)
            .await
            .map_err(|e| e.with_phase(Phase::Plan))?;

        let parsed = plan::parse_plan(&outcome.output)
            .map_err(|e| QuorumError::plan_parse(e.to_string()).with_phase(Phase::Plan))?;
        let revision = self.plan_revision(&wf.id).await?;
        let parsed = plan::remap_revision(parsed, revision);

        self.write_overwrite(
            &wf.id,
            "plan-phase/final-plan.md",
            plan::render_plan_doc(&wf.title, &parsed).as_bytes(),
        )
        .await
        .map_err(|e| e.with_phase(Phase::Plan))?;
        for task in &parsed {
            self.write_once(
                &wf.id,
                &format!("plan-phase/tasks/{}.md", task.id),
                plan::render_task_md(task).as_bytes(),
            )
            .await
            .map_err(|e| e.with_phase(Phase::Plan))?;
        }

        // Replace the stored task DAG with the fresh generation.
        self.ctx
            .store
            .delete_tasks(&wf.id)
            .await
            .map_err(|e| QuorumError::internal(e.to_string()).with_phase(Phase::Plan))?;
        let mut tasks = Vec::with_capacity(parsed.len());
        for pt in &parsed {
            let task = plan_task_to_task(&wf.id, pt);
            self.ctx
                .store
                .add_task(&task)
                .await
                .map_err(|e| QuorumError::internal(e.to_string()).with_phase(Phase::Plan))?;
            tasks.push(task);
        }
        info!(workflow_id = %wf.id, tasks = tasks.len(), revision, "plan loaded");
        Ok(tasks)
    }

    /// Plan generation counter derived from the on-disk task artifacts:
    /// replans get a fresh `r<N>-` id namespace.
    async fn plan_revision(&self, workflow_id: &WorkflowId) -> Result<u32, QuorumError> {
        let entries = self
            .ctx
            .artifacts
            .list(workflow_id, "plan-phase/tasks")
            .await
            .map_err(|e| QuorumError::internal(e.to_string()))?;
        if entries.is_empty() {
            return Ok(1);
        }
        let max_rev = entries
            .iter()
            .filter_map(|name| {
                name.strip_prefix('r')
                    .and_then(|rest| rest.split('-').next())
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(1);
        Ok(max_rev + 1)
    }

    // -----------------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------------

    /// Run the stored task DAG through the scheduler. Task state changes are
    /// persisted and published in order; agent output lands under
    /// `execute-phase/<task-id>/`.
    pub async fn run_execute(
        &self,
        wf: &Workflow,
        cancel: &CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> Result<RunSummary, QuorumError> {
        let tasks = self
            .ctx
            .store
            .list_tasks(&wf.id)
            .await
            .map_err(|e| QuorumError::internal(e.to_string()).with_phase(Phase::Execute))?;

        let specs: Vec<TaskSpec> = tasks
            .iter()
            .map(|t| TaskSpec {
                id: t.id.clone(),
                name: t.name.clone(),
                agent: t.agent.clone(),
                depends_on: t.depends_on.clone(),
                timeout: Duration::from_secs(t.timeout_s.max(1)),
            })
            .collect();
        let graph = TaskGraph::build(specs)
            .map_err(|e| QuorumError::validation(e.to_string()).with_phase(Phase::Execute))?;

        let engine_cfg = self.ctx.engine_config();
        let scheduler = DagScheduler::new(
            self.ctx.registry.clone(),
            RetryPolicy {
                max_retries: wf.config.max_retries,
                ..RetryPolicy::from_engine_config(&engine_cfg)
            },
            Duration::from_secs(engine_cfg.cancel_grace_s),
        );

        let sink = Arc::new(ProgressSink::new());
        let executor: Arc<dyn TaskExecutor> = Arc::new(PhaseExecutor {
            pipeline: self.clone(),
            workflow_id: wf.id.clone(),
            context: wf
                .optimized_prompt
                .clone()
                .unwrap_or_else(|| wf.prompt.clone()),
            sink: sink.clone(),
        });

        let (notice_tx, notice_rx) = flume::unbounded();
        let run_ctx = RunContext {
            cancel: cancel.child_token(),
            pause,
            notices: notice_tx,
        };

        // Progress pump: publishes coalesced task.progress events until the
        // run finishes.
        let pump_stop = CancellationToken::new();
        let pump = {
            let sink = sink.clone();
            let ctx = self.ctx.clone();
            let wf_id = wf.id.clone();
            let stop = pump_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sink.changed() => {}
                        _ = stop.cancelled() => break,
                    }
                    for update in sink.drain() {
                        ctx.publish_task(
                            &wf_id,
                            &update.task_id,
                            None,
                            EventKind::TaskProgress,
                            serde_json::json!({
                                "fraction": update.fraction,
                                "message": update.message,
                            }),
                        );
                    }
                }
            })
        };

        // Notice handler: one sequential persist -> publish step per task
        // state change, concurrent with the dispatcher.
        let notice_handler = async {
            while let Ok(notice) = notice_rx.recv_async().await {
                self.apply_notice(&wf.id, notice).await;
            }
        };

        let (summary, ()) = tokio::join!(scheduler.run(run_ctx, &graph, executor), notice_handler);

        pump_stop.cancel();
        let _ = pump.await;

        self.ctx
            .artifacts
            .finalize(&wf.id)
            .await
            .map_err(|e| QuorumError::internal(e.to_string()).with_phase(Phase::Execute))?;

        Ok(summary)
    }

    /// Persist one task transition, then publish its event — in that order.
    async fn apply_notice(&self, workflow_id: &WorkflowId, notice: TaskNotice) {
        let TaskNotice {
            task_id,
            transition,
        } = notice;
        let now = Utc::now();
        let (patch, kind, payload) = match transition {
            TaskTransition::Queued { attempt } => (
                TaskPatch::status(TaskStatus::Queued),
                EventKind::TaskQueued,
                serde_json::json!({ "attempt": attempt }),
            ),
            TaskTransition::Started { attempt } => (
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    attempts: Some(attempt),
                    started_at: Some(now),
                    ..TaskPatch::default()
                },
                EventKind::TaskStarted,
                serde_json::json!({ "attempt": attempt }),
            ),
            TaskTransition::Completed { outcome } => (
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    output: Some(outcome.output.clone()),
                    output_file: outcome.output_file.clone(),
                    finished_at: Some(now),
                    error: Some(None),
                    ..TaskPatch::default()
                },
                EventKind::TaskCompleted,
                serde_json::json!({ "output_file": outcome.output_file }),
            ),
            TaskTransition::Failed { error } => (
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    finished_at: Some(now),
                    ..TaskPatch::default()
                }
                .with_error(error.to_string()),
                EventKind::TaskFailed,
                serde_json::to_value(&error).unwrap_or_default(),
            ),
            TaskTransition::Skipped => (
                TaskPatch {
                    status: Some(TaskStatus::Skipped),
                    finished_at: Some(now),
                    ..TaskPatch::default()
                },
                EventKind::TaskSkipped,
                serde_json::json!({ "reason": "ancestor failed" }),
            ),
        };

        match self.ctx.store.update_task(workflow_id, &task_id, &patch).await {
            Ok(task) => {
                self.ctx
                    .publish_task(workflow_id, &task_id, Some(&task.agent), kind, payload);
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, task_id = %task_id, error = %e,
                      "failed to persist task transition");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Agent invocation
    // -----------------------------------------------------------------------

    /// Call one agent and drain its stream, translating agent events into
    /// bus events. `metered` selects whether this call acquires the agent's
    /// slot itself (phase-level calls) or runs under a slot the scheduler
    /// already holds (task execution).
    #[allow(clippy::too_many_arguments)]
    async fn call_agent(
        &self,
        workflow_id: &WorkflowId,
        task_id: Option<&TaskId>,
        agent: &str,
        request: ExecuteRequest,
        cancel: &CancellationToken,
        metered: bool,
        sink: Option<&ProgressSink>,
    ) -> Result<TaskOutcome, QuorumError> {
        let timeout = request.timeout;
        let child = cancel.child_token();

        let run = if metered {
            tokio::select! {
                run = self.ctx.registry.execute(agent, request, child.clone()) => run,
                _ = cancel.cancelled() => {
                    return Err(QuorumError::canceled("cancelled while waiting for an agent slot"));
                }
            }
        } else {
            self.ctx
                .registry
                .execute_unmetered(agent, request, child.clone())
                .await
        }
        .map_err(|e| QuorumError::internal(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_partial = String::new();
        loop {
            let event = match tokio::time::timeout_at(deadline, run.events.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => {
                    // Stream closed without a terminal event.
                    return Err(QuorumError::agent(
                        AgentFailureKind::Internal,
                        "agent stream ended without a result",
                    ));
                }
                Err(_) => {
                    child.cancel();
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentError,
                        serde_json::json!({ "kind": "timeout" }));
                    return Err(QuorumError::agent(
                        AgentFailureKind::Timeout,
                        format!("agent `{agent}` exceeded {}s", timeout.as_secs()),
                    ));
                }
            };

            match event {
                AgentEvent::Started => {
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentStarted,
                        serde_json::json!({}));
                }
                AgentEvent::Thinking { text } => {
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentThinking,
                        serde_json::json!({ "text": truncate(&text, 500) }));
                }
                AgentEvent::ToolUse { tool, args } => {
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentToolUse,
                        serde_json::json!({ "tool": tool, "args": args }));
                }
                AgentEvent::Progress { fraction, message } => {
                    if let (Some(sink), Some(task_id)) = (sink, task_id) {
                        sink.record(ProgressUpdate {
                            task_id: task_id.clone(),
                            fraction,
                            message,
                        });
                    }
                }
                AgentEvent::PartialOutput { delta } => {
                    last_partial.push_str(&delta);
                }
                AgentEvent::Completed {
                    output,
                    output_file,
                    diff,
                } => {
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentCompleted,
                        serde_json::json!({ "output_bytes": output.len() }));
                    return Ok(TaskOutcome {
                        output,
                        output_file,
                        diff,
                    });
                }
                AgentEvent::Error { kind, message } => {
                    self.publish_agent(workflow_id, task_id, agent, EventKind::AgentError,
                        serde_json::json!({ "kind": kind.as_str(), "message": message }));
                    debug!(agent, %message, "agent reported error");
                    return Err(match kind {
                        AgentFailureKind::Canceled => QuorumError::canceled(message),
                        other => QuorumError::agent(other, message),
                    });
                }
            }
        }
    }

    fn publish_agent(
        &self,
        workflow_id: &WorkflowId,
        task_id: Option<&TaskId>,
        agent: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        match task_id {
            Some(task_id) => self.ctx.publish_task(workflow_id, task_id, Some(agent), kind, payload),
            None => {
                let event = qm_events::Event::for_workflow(
                    self.ctx.project_id.clone(),
                    workflow_id.clone(),
                    kind,
                    payload,
                )
                .with_agent(agent);
                self.ctx.publish(event);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Artifact helpers
    // -----------------------------------------------------------------------

    async fn write_once(
        &self,
        workflow_id: &WorkflowId,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<(), QuorumError> {
        self.ctx
            .artifacts
            .write(workflow_id, rel_path, bytes)
            .await
            .map_err(|e| QuorumError::internal(e.to_string()))?;
        self.publish_artifact(workflow_id, rel_path, bytes.len());
        Ok(())
    }

    async fn write_overwrite(
        &self,
        workflow_id: &WorkflowId,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<(), QuorumError> {
        self.ctx
            .artifacts
            .write_overwrite(workflow_id, rel_path, bytes)
            .await
            .map_err(|e| QuorumError::internal(e.to_string()))?;
        self.publish_artifact(workflow_id, rel_path, bytes.len());
        Ok(())
    }

    fn publish_artifact(&self, workflow_id: &WorkflowId, rel_path: &str, size: usize) {
        self.ctx.publish_workflow(
            workflow_id,
            EventKind::ArtifactWritten,
            serde_json::json!({ "path": rel_path, "size_bytes": size }),
        );
    }
}

// ---------------------------------------------------------------------------
// PhaseExecutor — routes scheduler attempts through the registry
// ---------------------------------------------------------------------------

struct PhaseExecutor {
    pipeline: Pipeline,
    workflow_id: WorkflowId,
    context: String,
    sink: Arc<ProgressSink>,
}

#[async_trait]
impl TaskExecutor for PhaseExecutor {
    async fn execute(
        &self,
        task: &TaskSpec,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, QuorumError> {
        let prompt = format!(
            "Execute this task as part of a larger plan.\n\nTask: {}\n\n\
             Overall goal:\n{}",
            task.name, self.context
        );
        let models = self.pipeline.ctx.config.load().agents.models.clone();
        let request =
            ExecuteRequest::new(prompt, task.timeout).with_model(models.get(&task.agent).cloned());
        let outcome = self
            .pipeline
            .call_agent(
                &self.workflow_id,
                Some(&task.id),
                &task.agent,
                request,
                &cancel,
                false,
                Some(self.sink.as_ref()),
            )
            .await
            .map_err(|e| e.with_task(task.id.clone()))?;

        let attempt_path = |canonical: String| {
            if attempt == 1 {
                canonical
            } else {
                ArtifactStore::retry_path(&canonical, attempt)
            }
        };
        let rel_path = attempt_path(format!("execute-phase/{}/output.txt", task.id));
        self.pipeline
            .write_overwrite(&self.workflow_id, &rel_path, outcome.output.as_bytes())
            .await?;
        if let Some(diff) = &outcome.diff {
            let diff_path = attempt_path(format!("execute-phase/{}/diff.patch", task.id));
            self.pipeline
                .write_overwrite(&self.workflow_id, &diff_path, diff.as_bytes())
                .await?;
        }

        Ok(TaskOutcome {
            output: outcome.output,
            output_file: Some(rel_path),
            diff: outcome.diff,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn plan_task_to_task(workflow_id: &WorkflowId, pt: &PlanTask) -> Task {
    Task::new(
        TaskId::new(pt.id.clone()),
        workflow_id.clone(),
        pt.name.clone(),
        pt.agent.clone(),
        pt.depends_on.iter().map(|d| TaskId::new(d.clone())).collect(),
        pt.timeout_s,
    )
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
