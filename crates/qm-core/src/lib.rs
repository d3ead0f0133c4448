//! Core data model, configuration, and persistence for the quorum
//! orchestrator: workflow/task records, the error taxonomy, the durable
//! workflow store at `.quorum/state.db`, and the on-disk artifact tree
//! under `.quorum/runs/<workflow-id>/`.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod ids;
pub mod store;
pub mod types;

pub use error::{ErrorKind, QuorumError};
pub use ids::{TaskId, WorkflowId};
