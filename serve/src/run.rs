//! Handle the run-start and run-read HTTP routes (`spec.md` §6, "External
//! interfaces"): the payload shape and SSE event vocabulary are the core's;
//! this module only does request parsing, error-to-HTTP-status mapping, and
//! wiring the resulting frame stream into an axum SSE response.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use branchmind_core::{AgentRepository, RunCoordinatorError, RunInput};
use branchmind_protocol::{keepalive_comment, SseFrame};
use serde::Deserialize;

use crate::app::AppState;
use crate::stream::sse_response;

const HEARTBEAT_IDLE: Duration = Duration::from_secs(20);
/// Bound on a run's total inline image payload (`spec.md` §6: "images total
/// size bounded (default 20 MB)").
const MAX_IMAGES_BYTES: usize = 20 * 1024 * 1024;

#[derive(Deserialize)]
pub(crate) struct StartRunRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    conversation_history: Vec<String>,
    /// Base64-encoded inline images, decoded before being handed to C5.
    #[serde(default)]
    images: Vec<String>,
}

fn api_key_from(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| state.settings.llm_default_key.clone())
        .unwrap_or_default()
}

/// `POST /sessions/:session_id/agents/:root_agent_id/runs`: creates a
/// `pending` run against `root_agent_id` via C2, then immediately starts it
/// via C6 and streams the resulting SSE frames. The external interface
/// (`spec.md` §6) describes a run "identified by session_id and run_id" whose
/// payload nonetheless carries `root_agent_id`; since run creation itself is
/// CRUD the spec places out of scope, this route folds create-then-start into
/// one call rather than inventing a second, unspecified creation endpoint.
pub(crate) async fn start_run(
    State(state): State<Arc<AppState>>,
    Path((session_id, root_agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<StartRunRequest>,
) -> Response {
    let total_image_bytes: usize = body.images.iter().map(|s| s.len()).sum();
    if total_image_bytes > MAX_IMAGES_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, "images exceed the 20 MB bound").into_response();
    }

    let mut images = Vec::with_capacity(body.images.len());
    for encoded in &body.images {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => images.push(bytes),
            Err(_) => return (StatusCode::BAD_REQUEST, "image is not valid base64").into_response(),
        }
    }

    let input = RunInput {
        prompt: body.prompt,
        task: body.task,
        conversation_history: body.conversation_history,
    };

    let run = match state.repository.create_run(&session_id, &root_agent_id, input.clone()).await {
        Ok(run) => run,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    let api_key = api_key_from(&headers, &state);
    match state
        .coordinator
        .start_run(&session_id, &run.run_id, &api_key, input, images)
        .await
    {
        Ok(frames) => sse_response(frames, HEARTBEAT_IDLE),
        Err(e) => coordinator_error_response(e),
    }
}

/// `GET /sessions/:session_id/runs/:run_id`: retrieves the persisted run
/// record. Used for reconnection once a run has reached a terminal state
/// (`spec.md` §4.6 step 6: "subsequent clients may retrieve the completed
/// run") and for polling a run's progress without holding an SSE connection
/// open.
pub(crate) async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((session_id, run_id)): Path<(String, String)>,
) -> Response {
    match state.repository.get_run(&session_id, &run_id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

fn coordinator_error_response(err: RunCoordinatorError) -> Response {
    match err {
        RunCoordinatorError::RunAlreadyStartedOrFinished => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        RunCoordinatorError::SnapshotUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        RunCoordinatorError::Orchestrator(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// Renders one `SseFrame` as the literal bytes written to the response body,
/// reusing `branchmind_protocol`'s own wire-format ownership instead of
/// re-deriving it through axum's `sse::Event` builder.
pub(crate) fn frame_bytes(frame: &SseFrame) -> String {
    frame.to_sse_text()
}

pub(crate) fn heartbeat_bytes() -> &'static str {
    keepalive_comment()
}
