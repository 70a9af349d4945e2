//! Run Coordinator (C6, `spec.md` §4.6): drives a run from request to
//! terminal state, multiplexing C5's events into the SSE wire format and
//! persisting outcomes via C2.

use std::collections::HashMap;
use std::sync::Arc;

use branchmind_config::Settings;
use branchmind_protocol::{FrameKind, FrameSequencer, SseFrame};
use futures::stream::{Stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{BuildError, TreeCache};
use crate::error::OrchestratorError;
use crate::executor::{AgentStatus, DelegationRefusalReason, Executor, ExecutionContext, RunEvent};
use crate::llm::{GenerationRequest, LlmClient, StreamItem};
use crate::model::{LogEntry, LogLevel, RunInput, RunOutput, RunStatus};
use crate::repository::AgentRepository;

#[derive(Debug, Error, Clone)]
pub enum RunCoordinatorError {
    #[error("run is not pending; already started or finished")]
    RunAlreadyStartedOrFinished,
    #[error("agent tree snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

const SYNTHESIS_SYSTEM_PROMPT: &str =
    "You combine a lead agent's answer with its delegated sub-agents' findings into one \
     coherent final answer for the user. Do not mention internal agent names.";

/// `start_run(session_id, run_id, api_key, input, images?) -> stream<SseFrame>` (`spec.md` §4.6).
pub struct RunCoordinator<L, R> {
    llm: Arc<L>,
    repository: Arc<R>,
    cache: Arc<TreeCache<R, L>>,
    settings: Arc<Settings>,
}

impl<L, R> RunCoordinator<L, R>
where
    L: LlmClient + Send + Sync + 'static,
    R: AgentRepository + Send + Sync + 'static,
{
    pub fn new(llm: Arc<L>, repository: Arc<R>, cache: Arc<TreeCache<R, L>>, settings: Arc<Settings>) -> Self {
        Self { llm, repository, cache, settings }
    }

    pub async fn start_run(
        &self,
        session_id: &str,
        run_id: &str,
        api_key: &str,
        input: RunInput,
        images: Vec<Vec<u8>>,
    ) -> Result<impl Stream<Item = SseFrame>, RunCoordinatorError> {
        let run = self.repository.get_run(session_id, run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(RunCoordinatorError::RunAlreadyStartedOrFinished);
        }

        self.repository
            .update_run_status(session_id, run_id, RunStatus::Running, None)
            .await?;

        let root_agent = match self.repository.get_agent(session_id, &run.root_agent_id).await {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_run(session_id, run_id, &e.to_string()).await;
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(error_frame(&mut FrameSequencer::new(), e.kind(), &e.to_string())).await;
                return Ok(frame_stream_from_channel(rx));
            }
        };

        let snapshot = match self.cache.get_or_build(session_id, &root_agent.agent_id, api_key).await {
            Ok(snapshot) => snapshot,
            Err(BuildError::Unavailable(message)) => {
                self.fail_run(session_id, run_id, &message).await;
                let (tx, rx) = mpsc::channel(1);
                let mut seq = FrameSequencer::new();
                let _ = tx.send(error_frame(&mut seq, "SnapshotUnavailable", &message)).await;
                return Ok(frame_stream_from_channel(rx));
            }
        };

        let (event_tx, event_rx) = mpsc::channel(self.settings.channel_capacity);
        let (frame_tx, frame_rx) = mpsc::channel(self.settings.channel_capacity);
        let cancel = CancellationToken::new();

        let executor = Arc::new(Executor::new(self.llm.clone(), self.repository.clone(), self.settings.clone()));
        let context = ExecutionContext {
            parent_output: None,
            conversation_history: input.conversation_history.clone(),
            images,
            api_key: api_key.to_string(),
            snapshot: Arc::new(snapshot),
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
        };
        let task = input.effective_task();

        let producer_cancel = cancel.clone();
        let producer_executor = executor.clone();
        let producer_root = root_agent.clone();
        tokio::spawn(async move {
            producer_executor
                .execute(producer_root, task, context, 0, vec![], producer_cancel, event_tx)
                .await;
        });

        let run_id_owned = run_id.to_string();
        let session_id_owned = session_id.to_string();
        let root_agent_id = root_agent.agent_id.clone();
        let repository = self.repository.clone();
        let llm = self.llm.clone();
        let settings = self.settings.clone();
        let root_model = root_agent.parameters.model.clone();
        let root_temperature = root_agent.parameters.temperature;
        let api_key_owned = api_key.to_string();
        let run_timeout = settings.run_timeout;

        tokio::spawn(async move {
            let consume = Self::consume_events(
                event_rx,
                frame_tx.clone(),
                repository.clone(),
                session_id_owned.clone(),
                run_id_owned.clone(),
                root_agent_id.clone(),
            );

            let outcome = tokio::time::timeout(run_timeout, consume).await;
            let mut seq_state = FrameSequencer::new();

            let (agent_outputs, root_failed_without_text) = match outcome {
                Ok(state) => state,
                Err(_elapsed) => {
                    cancel.cancel();
                    let _ = repository
                        .update_run_status(&session_id_owned, &run_id_owned, RunStatus::Failed, Some("run timeout exceeded".to_string()))
                        .await;
                    let _ = frame_tx.send(error_frame(&mut seq_state, "Timeout", "run timeout exceeded")).await;
                    return;
                }
            };

            if root_failed_without_text {
                let _ = repository
                    .update_run_status(&session_id_owned, &run_id_owned, RunStatus::Failed, Some("root agent produced no output".to_string()))
                    .await;
                let _ = frame_tx
                    .send(error_frame(&mut seq_state, "RootProducedNoOutput", "root agent produced no output"))
                    .await;
                return;
            }

            let root_output = agent_outputs.get(&root_agent_id).cloned().unwrap_or_default();
            let final_output = Self::synthesize(
                llm.as_ref(),
                &api_key_owned,
                &root_model,
                root_temperature,
                &root_output,
                &agent_outputs,
                &root_agent_id,
            )
            .await;

            let output = RunOutput { final_output: final_output.clone(), per_agent_output: agent_outputs };
            let _ = repository.set_run_output(&session_id_owned, &run_id_owned, output.clone()).await;
            let _ = repository
                .update_run_status(&session_id_owned, &run_id_owned, RunStatus::Completed, None)
                .await;

            let _ = frame_tx
                .send(seq_state.next(
                    FrameKind::Completed,
                    None,
                    json!({ "final_output": output.final_output, "per_agent_output": output.per_agent_output }),
                ))
                .await;
        });

        Ok(frame_stream_from_channel(frame_rx))
    }

    /// Consumes C5's events, converting each to an SSE frame, appending
    /// pertinent ones to the run log, and returning the accumulated
    /// `agent_outputs` plus whether the root failed without producing text.
    async fn consume_events(
        mut event_rx: mpsc::Receiver<RunEvent>,
        frame_tx: mpsc::Sender<SseFrame>,
        repository: Arc<R>,
        session_id: String,
        run_id: String,
        root_agent_id: String,
    ) -> (HashMap<String, String>, bool) {
        let mut seq = FrameSequencer::new();
        let mut agent_outputs = HashMap::new();
        let mut root_failed_without_text = false;

        let _ = frame_tx
            .send(seq.next(FrameKind::Connected, None, json!({ "run_id": run_id })))
            .await;

        while let Some(event) = event_rx.recv().await {
            match event {
                RunEvent::Log { agent_id, message, level } => {
                    let _ = repository
                        .append_run_log(
                            &session_id,
                            &run_id,
                            LogEntry { agent_id: agent_id.clone(), timestamp: chrono::Utc::now(), message: message.clone(), level },
                        )
                        .await;
                    if frame_tx
                        .send(seq.next(FrameKind::Log, agent_id, json!({ "message": message, "level": level_str(level) })))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::Status { agent_id, state } => {
                    if frame_tx
                        .send(seq.next(FrameKind::Status, Some(agent_id), json!(state.as_str())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::OutputChunk { agent_id, text } => {
                    if frame_tx
                        .send(seq.next(FrameKind::OutputChunk, Some(agent_id), json!(text)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::Output { agent_id, text } => {
                    agent_outputs.insert(agent_id.clone(), text.clone());
                    if frame_tx
                        .send(seq.next(FrameKind::Output, Some(agent_id), json!(text)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::Delegation { from, to, label } => {
                    if frame_tx
                        .send(seq.next(FrameKind::Delegation, Some(from.clone()), json!({ "from": from, "to": to, "label": label })))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::DelegationRefused { agent_id, reason } => {
                    let reason_str = match reason {
                        DelegationRefusalReason::Cycle => "cycle",
                        DelegationRefusalReason::Depth => "depth",
                    };
                    info!(agent_id, reason = reason_str, "delegation refused");
                }
                RunEvent::Error { agent_id, kind, message } => {
                    error!(agent_id = ?agent_id, kind, message, "agent-level error");
                    if frame_tx
                        .send(seq.next(FrameKind::Error, agent_id, json!({ "kind": kind, "message": message })))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::Timeout { agent_id } => {
                    if frame_tx
                        .send(seq.next(FrameKind::Status, Some(agent_id), json!(AgentStatus::Failed.as_str())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RunEvent::Cancelled { agent_id } => {
                    if frame_tx
                        .send(seq.next(FrameKind::Status, Some(agent_id), json!(AgentStatus::Cancelled.as_str())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        if agent_outputs.get(&root_agent_id).map(|t| t.trim().is_empty()).unwrap_or(true) {
            root_failed_without_text = true;
        }

        (agent_outputs, root_failed_without_text)
    }

    /// Final synthesis (`spec.md` §4.6): a second C1 invocation using the
    /// root's parameters, falling back to plain concatenation if it fails.
    async fn synthesize(
        llm: &L,
        api_key: &str,
        model: &str,
        temperature: f32,
        root_output: &str,
        agent_outputs: &HashMap<String, String>,
        root_agent_id: &str,
    ) -> String {
        let child_block: String = agent_outputs
            .iter()
            .filter(|(id, _)| id.as_str() != root_agent_id)
            .map(|(id, text)| format!("[{id}]\n{text}\n"))
            .collect();

        if child_block.trim().is_empty() {
            return root_output.to_string();
        }

        let user_prompt = format!("Lead answer:\n{root_output}\n\nDelegated findings:\n{child_block}");
        let request = GenerationRequest {
            agent_id: format!("{root_agent_id}:synthesis"),
            api_key: api_key.to_string(),
            model: model.to_string(),
            system_prompt: SYNTHESIS_SYSTEM_PROMPT.to_string(),
            user_prompt,
            images: vec![],
            temperature,
            max_tokens: 2048,
        };

        let synthesized = async {
            let mut stream = llm.generate_stream(request, CancellationToken::new()).await?;
            let mut text = String::new();
            while let Some(item) = stream.next().await {
                match item? {
                    StreamItem::Chunk(chunk) => text.push_str(&chunk),
                    StreamItem::Done(_) => break,
                }
            }
            Ok::<String, OrchestratorError>(text)
        }
        .await;

        match synthesized {
            Ok(text) if !text.trim().is_empty() => text,
            _ => format!("{root_output}\n\n{child_block}"),
        }
    }

    async fn fail_run(&self, session_id: &str, run_id: &str, message: &str) {
        let _ = self
            .repository
            .update_run_status(session_id, run_id, RunStatus::Failed, Some(message.to_string()))
            .await;
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn error_frame(seq: &mut FrameSequencer, kind: &str, message: &str) -> SseFrame {
    seq.next(FrameKind::Error, None, json!({ "kind": kind, "message": message }))
}

fn frame_stream_from_channel(rx: mpsc::Receiver<SseFrame>) -> impl Stream<Item = SseFrame> {
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlm, MockResponse};
    use crate::model::{Agent, AgentParameters};
    use crate::repository::InMemoryAgentRepository;
    use chrono::Utc;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn agent(id: &str, parent: Option<&str>) -> Agent {
        Agent {
            agent_id: id.to_string(),
            session_id: "s1".to_string(),
            name: id.to_string(),
            role: "tester".to_string(),
            system_prompt: "repeat the task back to the user".to_string(),
            parameters: AgentParameters { model: "test-model".to_string(), temperature: 0.0, max_tokens: 200 },
            photo_injection_enabled: false,
            photo_injection_features: vec![],
            parent_id: parent.map(|p| p.to_string()),
            canvas_position: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn single_root_trivial_task_completes_with_matching_final_output() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        repo.insert_agent(agent("echo", None)).await;
        let run = repo
            .create_run("s1", "echo", RunInput { task: Some("hello".to_string()), ..Default::default() })
            .await
            .unwrap();

        let llm = Arc::new(MockLlm::echo());
        let cache = Arc::new(TreeCache::new(repo.clone(), llm.clone()));
        let coordinator = RunCoordinator::new(llm, repo.clone(), cache, settings());

        let stream = coordinator
            .start_run("s1", &run.run_id, "key", run.input.clone(), vec![])
            .await
            .unwrap();
        let frames: Vec<SseFrame> = stream.collect().await;

        assert!(frames.iter().any(|f| f.kind == FrameKind::Completed));
        let reloaded = repo.get_run("s1", &run.run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
        assert_eq!(reloaded.output.unwrap().final_output, "hello");
    }

    #[tokio::test]
    async fn restarting_a_non_pending_run_is_rejected() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        repo.insert_agent(agent("echo", None)).await;
        let run = repo.create_run("s1", "echo", RunInput::default()).await.unwrap();
        repo.update_run_status("s1", &run.run_id, RunStatus::Completed, None).await.unwrap();

        let llm = Arc::new(MockLlm::echo());
        let cache = Arc::new(TreeCache::new(repo.clone(), llm.clone()));
        let coordinator = RunCoordinator::new(llm, repo.clone(), cache, settings());

        let err = coordinator
            .start_run("s1", &run.run_id, "key", RunInput::default(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, RunCoordinatorError::RunAlreadyStartedOrFinished));
    }

    #[tokio::test]
    async fn cross_session_root_agent_fails_the_run() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        repo.insert_agent(agent("echo", None)).await;
        let run = repo.create_run("s1", "echo", RunInput::default()).await.unwrap();

        let llm = Arc::new(MockLlm::echo());
        let cache = Arc::new(TreeCache::new(repo.clone(), llm.clone()));
        let coordinator = RunCoordinator::new(llm, repo.clone(), cache, settings());

        let stream = coordinator
            .start_run("s2", &run.run_id, "key", RunInput::default(), vec![])
            .await;
        assert!(stream.is_err());
    }
}
