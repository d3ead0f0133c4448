//! The workflow orchestration engine: task-graph scheduling across agents,
//! the refine/analyze/plan/execute phase pipeline, the workflow lifecycle
//! state machine, and the kanban auto-execution loop.

pub mod consensus;
pub mod context;
pub mod engine;
pub mod graph;
pub mod kanban;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod scheduler;

pub use consensus::{ConsensusPolicy, JaccardConsensus};
pub use context::EngineContext;
pub use engine::WorkflowEngine;
pub use graph::{GraphError, TaskGraph, TaskSpec};
pub use kanban::{KanbanEngine, KanbanEngineStatus};
pub use pipeline::Pipeline;
pub use scheduler::{
    DagScheduler, RetryPolicy, RunContext, RunSummary, TaskExecutor, TaskNotice, TaskOutcome,
    TaskTransition,
};
