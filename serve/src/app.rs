//! Axum app: shared state and router.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use branchmind_config::Settings;
use branchmind_core::{InMemoryAgentRepository, LlmClient, RunCoordinator};

use crate::run;

/// Generic over the LLM backend so tests can wire in `MockLlm` instead of a
/// real provider; production wires in `HttpLlm` as `Arc<dyn LlmClient>`.
pub(crate) type Coordinator = RunCoordinator<dyn LlmClient, InMemoryAgentRepository>;

/// Shared process state: the repository seed data lives in, the coordinator
/// wired to a real provider client, and the settings both were built from.
/// Constructed via [`crate::app_state`]; fields stay crate-private.
pub struct AppState {
    pub(crate) repository: Arc<InMemoryAgentRepository>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) settings: Arc<Settings>,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/sessions/:session_id/agents/:root_agent_id/runs",
            post(run::start_run),
        )
        .route("/sessions/:session_id/runs/:run_id", get(run::get_run))
        .with_state(state)
}
