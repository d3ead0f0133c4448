//! Agent capability contract and registry.
//!
//! Concrete CLI adapters (how each agent process is spawned and parsed) live
//! outside the core; everything here is the uniform contract the scheduler
//! programs against: an [`AgentConnector`] produces a stream of
//! [`AgentEvent`]s, and the [`AgentRegistry`] enforces per-agent concurrency
//! quotas around it.

pub mod connector;
pub mod events;
pub mod registry;
pub mod scripted;

pub use connector::{AgentCapabilities, AgentConnector, ExecuteRequest};
pub use events::AgentEvent;
pub use registry::{AgentPermit, AgentRegistry, AgentRun, RegistryError};
pub use scripted::{ScriptedAgent, ScriptedBehavior, ScriptedResult};
