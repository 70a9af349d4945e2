//! # branchmind-core
//!
//! The Run Orchestrator: the subsystem that discovers a user-authored agent
//! tree, decides which children are relevant to a task, executes agents
//! concurrently in a bounded recursive fashion with context propagation,
//! streams incremental output and lifecycle events, and persists the final
//! run state.
//!
//! ## Components
//!
//! - [`llm`]: C1, the LLM Streaming Client — [`llm::LlmClient`] trait,
//!   [`llm::MockLlm`] for tests, [`llm::HttpLlm`] for a real provider.
//! - [`repository`]: C2, the Agent Repository — [`repository::AgentRepository`]
//!   trait and [`repository::InMemoryAgentRepository`], session-scoped
//!   persistence with cycle prevention.
//! - [`cache`]: C3, the Agent Tree Cache — [`cache::TreeCache`], single-flight
//!   capability snapshot builds with mutation-triggered invalidation.
//! - [`router`]: C4, the Capability Router — [`router::select_children`].
//! - [`executor`]: C5, the Recursive Executor — [`executor::Executor`],
//!   [`executor::RunEvent`].
//! - [`coordinator`]: C6, the Run Coordinator — [`coordinator::RunCoordinator`].
//! - [`model`]: the data model (`spec.md` §3).
//! - [`error`]: the error taxonomy (`spec.md` §7).

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod llm;
pub mod model;
pub mod repository;
pub mod router;

pub use cache::{BuildError, TreeCache};
pub use coordinator::{RunCoordinator, RunCoordinatorError};
pub use error::OrchestratorError;
pub use executor::{Executor, ExecutionContext, RunEvent};
pub use llm::{
    ChunkStream, FinishReason, GenerationRequest, HttpLlm, LlmClient, MockLlm, MockResponse,
    StreamItem,
};
pub use model::{
    Agent, AgentId, AgentParameters, AgentTreeSnapshot, Capability, Link, LogEntry, LogLevel, Run,
    RunId, RunInput, RunOutput, RunStatus, Session, SessionId,
};
pub use repository::{AgentRepository, InMemoryAgentRepository};
pub use router::select_children;
