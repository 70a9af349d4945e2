//! HTTP/SSE server for the run orchestrator (axum).
//!
//! Listens on http://127.0.0.1:8080, exposes `POST
//! /sessions/:session_id/agents/:root_agent_id/runs` (starts a run, streams
//! `spec.md` §6's SSE frames) and `GET /sessions/:session_id/runs/:run_id`
//! (reads back a run's persisted state).
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

mod app;
mod logging;
mod run;
mod stream;

use std::sync::Arc;

use branchmind_config::Settings;
use branchmind_core::{HttpLlm, InMemoryAgentRepository, LlmClient, RunCoordinator, TreeCache};
use tokio::net::TcpListener;
use tracing::info;

use app::router;
pub use app::AppState;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Assembles shared state from an already-constructed LLM backend and
/// repository. Split out from [`run_serve_on_listener`] so integration tests
/// can wire in `MockLlm` and a pre-seeded repository instead of a real
/// provider and an empty store.
pub fn app_state(
    llm: Arc<dyn LlmClient>,
    repository: Arc<InMemoryAgentRepository>,
    settings: Arc<Settings>,
) -> Arc<AppState> {
    let cache = Arc::new(TreeCache::new(repository.clone(), llm.clone()));
    let coordinator = Arc::new(RunCoordinator::new(llm, repository.clone(), cache, settings.clone()));
    Arc::new(AppState {
        repository,
        coordinator,
        settings,
    })
}

fn app_state_from_env() -> Result<Arc<AppState>, Box<dyn std::error::Error + Send + Sync>> {
    let settings = Arc::new(Settings::from_env()?);
    let base_url =
        std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlm::new(base_url).with_legacy_model_map(settings.legacy_model_map.clone()));
    Ok(app_state(llm, Arc::new(InMemoryAgentRepository::new()), settings))
}

/// Runs the server on an existing listener, state already assembled (e.g. via
/// [`app_state`] with a test LLM backend).
pub async fn run_serve_with_state(
    listener: TcpListener,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("run orchestrator listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Runs the server on an existing listener, wiring up `HttpLlm` and a fresh
/// in-memory repository from the environment. Used by tests (bind to
/// `127.0.0.1:0` then pass the listener in) as well as production.
pub async fn run_serve_on_listener(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = app_state_from_env()?;
    run_serve_with_state(listener, state).await
}

/// Runs the server. Listens on `addr` (default `127.0.0.1:8080`).
pub async fn run_serve(addr: Option<&str>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init();
    let addr = addr.unwrap_or(DEFAULT_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener).await
}
