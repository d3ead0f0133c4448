use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use qm_agents::AgentRegistry;
use qm_core::config::EngineConfig;
use qm_core::types::TaskStatus;
use qm_core::{QuorumError, TaskId};

use crate::graph::{TaskGraph, TaskSpec};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt (total attempts = retries + 1).
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_engine_config(cfg: &EngineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
        }
    }

    /// Delay before retry `retry_index` (0-based): `min(base * 2^n, cap)`.
    pub fn delay(&self, retry_index: u32) -> Duration {
        let factor = 1u64 << retry_index.min(20);
        self.backoff_base
            .saturating_mul(factor as u32)
            .min(self.backoff_cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub output: String,
    pub output_file: Option<String>,
    /// Unified diff of the changes the attempt made, when the agent
    /// reported one.
    pub diff: Option<String>,
}

/// One task attempt. Supplied by the phase pipeline, which routes through
/// the agent registry; tests plug in scripted executors. The scheduler holds
/// the task's agent slot for the whole call, so implementations go through
/// `AgentRegistry::execute_unmetered` rather than re-acquiring.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskSpec,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, QuorumError>;
}

// ---------------------------------------------------------------------------
// Task notices
// ---------------------------------------------------------------------------

/// State transitions reported by the scheduler, in per-task order
/// `queued (started (queued started)*)? (completed|failed|skipped)`.
/// The pipeline turns each notice into a persist-then-publish step.
#[derive(Debug, Clone)]
pub enum TaskTransition {
    Queued { attempt: u32 },
    Started { attempt: u32 },
    Completed { outcome: TaskOutcome },
    Failed { error: QuorumError },
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TaskNotice {
    pub task_id: TaskId,
    pub transition: TaskTransition,
}

// ---------------------------------------------------------------------------
// RunContext / RunSummary
// ---------------------------------------------------------------------------

/// Handles the caller threads into a run: cancellation scope, pause flag,
/// and the notice channel.
pub struct RunContext {
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
    pub notices: flume::Sender<TaskNotice>,
}

impl RunContext {
    /// A context with no pause control, for callers that only need
    /// cancellation (and tests).
    pub fn simple(
        cancel: CancellationToken,
    ) -> (Self, watch::Sender<bool>, flume::Receiver<TaskNotice>) {
        let (pause_tx, pause_rx) = watch::channel(false);
        let (notice_tx, notice_rx) = flume::unbounded();
        (
            Self {
                cancel,
                pause: pause_rx,
                notices: notice_tx,
            },
            pause_tx,
            notice_rx,
        )
    }
}

/// Terminal status of every task after a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    pub canceled: bool,
}

impl RunSummary {
    /// The aggregate is success iff every task ended `completed`; skipped
    /// counts as failure-caused.
    pub fn all_completed(&self) -> bool {
        self.statuses.values().all(|s| *s == TaskStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// DagScheduler
// ---------------------------------------------------------------------------

enum DispatcherMsg {
    Done {
        task_id: TaskId,
        result: Result<TaskOutcome, QuorumError>,
    },
    Requeue {
        task_id: TaskId,
    },
}

/// Dependency-resolving task scheduler.
///
/// A single dispatcher loop owns the ready/pending bookkeeping; workers are
/// spawned per attempt and report back over a completion channel, so no
/// graph state is ever shared across tasks. Per-agent concurrency is
/// enforced by acquiring the agent's registry slot at dispatch time and
/// holding it for the whole attempt.
pub struct DagScheduler {
    registry: Arc<AgentRegistry>,
    retry: RetryPolicy,
    grace: Duration,
}

impl DagScheduler {
    pub fn new(registry: Arc<AgentRegistry>, retry: RetryPolicy, grace: Duration) -> Self {
        Self {
            registry,
            retry,
            grace,
        }
    }

    /// Run the graph to completion (or cancellation) and return the
    /// terminal status of every task. An empty graph completes immediately
    /// and emits no notices.
    pub async fn run(
        &self,
        mut ctx: RunContext,
        graph: &TaskGraph,
        executor: Arc<dyn TaskExecutor>,
    ) -> RunSummary {
        let mut state = RunState::new(graph, &ctx.notices);
        if graph.is_empty() {
            return RunSummary {
                statuses: state.statuses,
                canceled: false,
            };
        }

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<DispatcherMsg>();
        state.backoff_tx = msg_tx.clone();

        // Seed: tasks with no dependencies are queued immediately.
        let roots: Vec<TaskId> = graph
            .tasks()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.id.clone())
            .collect();
        for id in roots {
            state.enqueue(id, 1);
        }

        loop {
            if ctx.cancel.is_cancelled() {
                return self.drain_cancelled(state, &mut msg_rx).await;
            }

            let paused = *ctx.pause.borrow();
            if !paused {
                while let Some(id) = self.pick_dispatchable(&state, graph) {
                    if !self.dispatch(&mut state, graph, &executor, &ctx.cancel, &msg_tx, id) {
                        // Lost the last slot to a concurrent workflow.
                        break;
                    }
                }
            }

            if state.all_terminal() && state.in_flight.is_empty() && state.pending_backoffs == 0 {
                break;
            }

            tokio::select! {
                msg = msg_rx.recv() => {
                    // The dispatcher holds a sender; recv never yields None here.
                    if let Some(msg) = msg {
                        self.handle(&mut state, graph, msg);
                    }
                }
                _ = pause_changed(&mut ctx.pause) => {}
                _ = ctx.cancel.cancelled() => {}
                // Capacity freed by a concurrent workflow does not message
                // this dispatcher; re-poll while work is waiting on slots.
                _ = tokio::time::sleep(Duration::from_millis(100)),
                    if !state.ready.is_empty() && !paused => {}
            }
        }

        RunSummary {
            statuses: state.statuses,
            canceled: false,
        }
    }

    /// Pick the best dispatchable ready task, or `None`.
    ///
    /// Order: (1) largest free-slot ratio of the task's agent, (2) lowest
    /// in-degree in the original graph, (3) smallest task id. Tasks whose
    /// agent is at capacity are not candidates; agents the registry does not
    /// meter always qualify.
    fn pick_dispatchable(&self, state: &RunState, graph: &TaskGraph) -> Option<TaskId> {
        let mut best: Option<(f64, usize, &TaskId)> = None;
        for id in &state.ready {
            let spec = graph.get(id).expect("ready task is in graph");
            let metered = self.registry.slots(&spec.agent).is_some();
            if metered && !self.registry.has_capacity(&spec.agent) {
                continue;
            }
            let ratio = if metered {
                self.registry.free_ratio(&spec.agent)
            } else {
                0.0
            };
            let in_degree = graph.in_degree(id);
            let better = match &best {
                None => true,
                Some((best_ratio, best_deg, best_id)) => {
                    match ratio.total_cmp(best_ratio) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => match in_degree.cmp(best_deg) {
                            Ordering::Less => true,
                            Ordering::Greater => false,
                            Ordering::Equal => id < *best_id,
                        },
                    }
                }
            };
            if better {
                best = Some((ratio, in_degree, id));
            }
        }
        best.map(|(_, _, id)| id.clone())
    }

    fn dispatch(
        &self,
        state: &mut RunState,
        graph: &TaskGraph,
        executor: &Arc<dyn TaskExecutor>,
        cancel: &CancellationToken,
        msg_tx: &mpsc::UnboundedSender<DispatcherMsg>,
        id: TaskId,
    ) -> bool {
        let spec = graph.get(&id).expect("dispatched task is in graph").clone();
        let permit = match self.registry.try_acquire(&spec.agent) {
            Some(permit) => permit,
            // Raced with another workflow for the last slot; try again later.
            None => return false,
        };

        state.ready.remove(&id);
        let attempt = state.failures.get(&id).copied().unwrap_or(0) + 1;
        state.transition(&id, TaskStatus::Running, TaskTransition::Started { attempt });
        state.in_flight.insert(id.clone());

        let exec = executor.clone();
        let child = cancel.child_token();
        let tx = msg_tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = exec.execute(&spec, attempt, child).await;
            let _ = tx.send(DispatcherMsg::Done {
                task_id: spec.id,
                result,
            });
        });
        true
    }

    fn handle(&self, state: &mut RunState, graph: &TaskGraph, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Done { task_id, result } => {
                state.in_flight.remove(&task_id);
                match result {
                    Ok(outcome) => self.complete(state, graph, task_id, outcome),
                    Err(error) => self.fail_or_retry(state, graph, task_id, error),
                }
            }
            DispatcherMsg::Requeue { task_id } => {
                state.pending_backoffs -= 1;
                // The task may have been skipped while it waited out the
                // backoff (an ancestor on another path failed).
                if state.statuses.get(&task_id) == Some(&TaskStatus::Queued) {
                    state.ready.insert(task_id);
                }
            }
        }
    }

    fn complete(&self, state: &mut RunState, graph: &TaskGraph, id: TaskId, outcome: TaskOutcome) {
        state.transition(&id, TaskStatus::Completed, TaskTransition::Completed { outcome });
        for dependent in graph.dependents(&id).to_vec() {
            let unmet = state.unmet.get_mut(&dependent).expect("dependent tracked");
            *unmet -= 1;
            if *unmet == 0 && state.statuses.get(&dependent) == Some(&TaskStatus::Pending) {
                state.enqueue(dependent, 1);
            }
        }
    }

    fn fail_or_retry(
        &self,
        state: &mut RunState,
        graph: &TaskGraph,
        id: TaskId,
        error: QuorumError,
    ) {
        let failures = state.failures.entry(id.clone()).or_insert(0);
        if error.is_retryable() && *failures < self.retry.max_retries {
            let retry_index = *failures;
            *failures += 1;
            let next_attempt = *failures + 1;
            let delay = self.retry.delay(retry_index);
            debug!(task = %id, retry_index, ?delay, "retrying after backoff");
            state.transition(
                &id,
                TaskStatus::Queued,
                TaskTransition::Queued {
                    attempt: next_attempt,
                },
            );
            state.pending_backoffs += 1;

            let tx = state.backoff_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(DispatcherMsg::Requeue { task_id: id });
            });
            return;
        }

        warn!(task = %id, error = %error, "task failed");
        state.transition(&id, TaskStatus::Failed, TaskTransition::Failed { error });

        // Strict descendants can never run; skip them. They are necessarily
        // still pending or queued-behind-a-backoff, never in flight.
        for descendant in graph.descendants(&id) {
            let status = state.statuses.get(&descendant).copied();
            if matches!(status, Some(s) if !s.is_terminal()) {
                state.ready.remove(&descendant);
                state.transition(&descendant, TaskStatus::Skipped, TaskTransition::Skipped);
            }
        }
    }

    /// Cancellation drain: wait up to the grace period for in-flight workers
    /// to exit cooperatively, then abandon them; everything non-terminal is
    /// recorded as `failed(kind=canceled)`.
    async fn drain_cancelled(
        &self,
        mut state: RunState,
        msg_rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>,
    ) -> RunSummary {
        let deadline = tokio::time::Instant::now() + self.grace;
        while !state.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, msg_rx.recv()).await {
                Ok(Some(DispatcherMsg::Done { task_id, result })) => {
                    state.in_flight.remove(&task_id);
                    match result {
                        // Finished under the wire; keep the real outcome.
                        Ok(outcome) => state.transition(
                            &task_id,
                            TaskStatus::Completed,
                            TaskTransition::Completed { outcome },
                        ),
                        Err(error) => state.transition(
                            &task_id,
                            TaskStatus::Failed,
                            TaskTransition::Failed { error },
                        ),
                    }
                }
                Ok(Some(DispatcherMsg::Requeue { .. })) => {
                    state.pending_backoffs = state.pending_backoffs.saturating_sub(1);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = state.in_flight.len(),
                        "cancellation grace elapsed, abandoning workers"
                    );
                    for task_id in std::mem::take(&mut state.in_flight) {
                        state.transition(
                            &task_id,
                            TaskStatus::Failed,
                            TaskTransition::Failed {
                                error: QuorumError::canceled(
                                    "abandoned after cancellation grace period",
                                )
                                .with_task(task_id.clone()),
                            },
                        );
                    }
                    break;
                }
            }
        }

        let remaining: Vec<TaskId> = state
            .statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in remaining {
            state.transition(
                &task_id,
                TaskStatus::Failed,
                TaskTransition::Failed {
                    error: QuorumError::canceled("run stopped").with_task(task_id.clone()),
                },
            );
        }

        RunSummary {
            statuses: state.statuses,
            canceled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RunState — owned by the dispatcher loop
// ---------------------------------------------------------------------------

struct RunState {
    statuses: BTreeMap<TaskId, TaskStatus>,
    unmet: HashMap<TaskId, usize>,
    ready: BTreeSet<TaskId>,
    failures: HashMap<TaskId, u32>,
    in_flight: BTreeSet<TaskId>,
    pending_backoffs: usize,
    notices: flume::Sender<TaskNotice>,
    backoff_tx: mpsc::UnboundedSender<DispatcherMsg>,
}

impl RunState {
    fn new(graph: &TaskGraph, notices: &flume::Sender<TaskNotice>) -> Self {
        // The backoff sender is replaced with the real dispatcher sender the
        // first time it is needed; see `DagScheduler::run`.
        let (placeholder_tx, _rx) = mpsc::unbounded_channel();
        Self {
            statuses: graph
                .tasks()
                .map(|t| (t.id.clone(), TaskStatus::Pending))
                .collect(),
            unmet: graph
                .tasks()
                .map(|t| (t.id.clone(), t.depends_on.len()))
                .collect(),
            ready: BTreeSet::new(),
            failures: HashMap::new(),
            in_flight: BTreeSet::new(),
            pending_backoffs: 0,
            notices: notices.clone(),
            backoff_tx: placeholder_tx,
        }
    }

    fn enqueue(&mut self, id: TaskId, attempt: u32) {
        self.transition(&id, TaskStatus::Queued, TaskTransition::Queued { attempt });
        self.ready.insert(id);
    }

    fn transition(&mut self, id: &TaskId, status: TaskStatus, transition: TaskTransition) {
        self.statuses.insert(id.clone(), status);
        let _ = self.notices.send(TaskNotice {
            task_id: id.clone(),
            transition,
        });
    }

    fn all_terminal(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }
}

async fn pause_changed(rx: &mut watch::Receiver<bool>) {
    // A dropped pause sender means no further pause transitions can happen;
    // park instead of spinning.
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
