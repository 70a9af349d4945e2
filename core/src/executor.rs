//! Recursive Executor (C5, `spec.md` §4.5): runs one agent, streams its
//! tokens upward, and recursively engages its selected children within
//! bounded depth and parallelism.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use branchmind_config::Settings;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::OrchestratorError;
use crate::llm::{synthetic_empty_completion_notice, GenerationRequest, LlmClient, StreamItem};
use crate::model::{Agent, AgentId, AgentTreeSnapshot, LogLevel, RunId, SessionId};
use crate::repository::AgentRepository;
use crate::router::select_children;

/// Last N conversation-history entries folded into the user prompt (`spec.md` §4.5).
const HISTORY_WINDOW: usize = 3;
/// Failure count within `FAILURE_WINDOW` that opens an agent's circuit (`spec.md` §4.5).
const CIRCUIT_FAILURE_THRESHOLD: usize = 3;
const CIRCUIT_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// SSE `status` values (`spec.md` §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Analyzing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Analyzing => "analyzing",
            AgentStatus::Executing => "executing",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationRefusalReason {
    Cycle,
    Depth,
}

/// Event taxonomy emitted by C5 (`spec.md` §4.5).
#[derive(Clone, Debug)]
pub enum RunEvent {
    Log {
        agent_id: Option<AgentId>,
        message: String,
        level: LogLevel,
    },
    Status {
        agent_id: AgentId,
        state: AgentStatus,
    },
    OutputChunk {
        agent_id: AgentId,
        text: String,
    },
    Output {
        agent_id: AgentId,
        text: String,
    },
    Delegation {
        from: AgentId,
        to: AgentId,
        label: Option<String>,
    },
    DelegationRefused {
        agent_id: AgentId,
        reason: DelegationRefusalReason,
    },
    Error {
        agent_id: Option<AgentId>,
        kind: &'static str,
        message: String,
    },
    Timeout {
        agent_id: AgentId,
    },
    Cancelled {
        agent_id: AgentId,
    },
}

/// Per-node execution inputs that do not change identity across the tree
/// (`spec.md` §4.5: `{parent_output?, conversation_history, images?, api_key,
/// snapshot, run_id, session_id}`).
#[derive(Clone)]
pub struct ExecutionContext {
    pub parent_output: Option<String>,
    pub conversation_history: Vec<String>,
    pub images: Vec<Vec<u8>>,
    pub api_key: String,
    pub snapshot: Arc<AgentTreeSnapshot>,
    pub run_id: RunId,
    pub session_id: SessionId,
}

#[derive(Default)]
struct CircuitState {
    failures: VecDeque<Instant>,
}

/// Runs one agent and its recursively-selected children, emitting `RunEvent`s
/// to a shared channel (the teacher's `StreamWriter`/`mpsc` idiom, generalized
/// from a single generic `StreamEvent<S>` to this orchestrator's own flat
/// event enum — see `DESIGN.md`).
pub struct Executor<L, R> {
    llm: Arc<L>,
    repository: Arc<R>,
    settings: Arc<Settings>,
    circuits: Mutex<HashMap<AgentId, CircuitState>>,
}

impl<L, R> Executor<L, R>
where
    L: LlmClient + Send + Sync + 'static,
    R: AgentRepository + Send + Sync + 'static,
{
    pub fn new(llm: Arc<L>, repository: Arc<R>, settings: Arc<Settings>) -> Self {
        Self {
            llm,
            repository,
            settings,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// `execute(agent, task, context, depth, path) -> stream<Event>` (`spec.md`
    /// §4.5), realized as events pushed onto `tx` rather than a returned
    /// stream, so recursive children share one channel with no merge step.
    pub fn execute(
        &self,
        agent: Agent,
        task: String,
        context: ExecutionContext,
        depth: u32,
        path: Vec<AgentId>,
        cancel: CancellationToken,
        tx: mpsc::Sender<RunEvent>,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if path.contains(&agent.agent_id) {
                let _ = tx
                    .send(RunEvent::DelegationRefused {
                        agent_id: agent.agent_id.clone(),
                        reason: DelegationRefusalReason::Cycle,
                    })
                    .await;
                return;
            }
            if depth >= self.settings.max_depth {
                let _ = tx
                    .send(RunEvent::DelegationRefused {
                        agent_id: agent.agent_id.clone(),
                        reason: DelegationRefusalReason::Depth,
                    })
                    .await;
                return;
            }
            if cancel.is_cancelled() {
                let _ = tx.send(RunEvent::Cancelled { agent_id: agent.agent_id.clone() }).await;
                return;
            }

            if self.circuit_open(&agent.agent_id).await {
                let _ = tx
                    .send(RunEvent::Error {
                        agent_id: Some(agent.agent_id.clone()),
                        kind: "CircuitOpen",
                        message: format!("circuit open for agent {}: too many recent failures", agent.agent_id),
                    })
                    .await;
                let _ = tx.send(RunEvent::Output { agent_id: agent.agent_id.clone(), text: String::new() }).await;
                let _ = tx
                    .send(RunEvent::Status { agent_id: agent.agent_id.clone(), state: AgentStatus::Completed })
                    .await;
                return;
            }

            let _ = tx
                .send(RunEvent::Status { agent_id: agent.agent_id.clone(), state: AgentStatus::Analyzing })
                .await;

            let system_prompt = self.build_system_prompt(&agent, &context);
            let user_prompt = self.build_user_prompt(&task, &context);

            let _ = tx
                .send(RunEvent::Status { agent_id: agent.agent_id.clone(), state: AgentStatus::Executing })
                .await;

            let outcome = self
                .stream_agent(&agent, &context, system_prompt, user_prompt, cancel.clone(), tx.clone())
                .await;

            let mut failed = false;
            let agent_output = match outcome {
                StreamOutcome::Completed(text) => text,
                StreamOutcome::TimedOut(text) => {
                    let _ = tx.send(RunEvent::Timeout { agent_id: agent.agent_id.clone() }).await;
                    text
                }
                StreamOutcome::Failed(text, err) => {
                    self.record_failure(&agent.agent_id).await;
                    failed = true;
                    let _ = tx
                        .send(RunEvent::Error {
                            agent_id: Some(agent.agent_id.clone()),
                            kind: err.kind(),
                            message: err.to_string(),
                        })
                        .await;
                    text
                }
            };

            let _ = tx
                .send(RunEvent::Output { agent_id: agent.agent_id.clone(), text: agent_output.clone() })
                .await;

            if !failed && !agent_output.trim().is_empty() && depth < self.settings.max_depth && !cancel.is_cancelled() {
                self.engage_children(&agent, &agent_output, &context, depth, &path, cancel.clone(), tx.clone())
                    .await;
            }

            let terminal = if cancel.is_cancelled() {
                RunEvent::Cancelled { agent_id: agent.agent_id.clone() }
            } else if failed {
                RunEvent::Status { agent_id: agent.agent_id.clone(), state: AgentStatus::Failed }
            } else {
                RunEvent::Status { agent_id: agent.agent_id.clone(), state: AgentStatus::Completed }
            };
            let _ = tx.send(terminal).await;
        })
    }

    async fn engage_children(
        &self,
        agent: &Agent,
        agent_output: &str,
        context: &ExecutionContext,
        depth: u32,
        path: &[AgentId],
        cancel: CancellationToken,
        tx: mpsc::Sender<RunEvent>,
    ) {
        let Some(capability) = context.snapshot.capability_map.get(&agent.agent_id) else {
            return;
        };
        let selected = select_children(agent_output, capability);
        if selected.is_empty() {
            return;
        }

        let mut child_agents = Vec::with_capacity(selected.len());
        for child_id in &selected {
            let _ = tx
                .send(RunEvent::Delegation { from: agent.agent_id.clone(), to: child_id.clone(), label: None })
                .await;
            match self.repository.get_agent(&context.session_id, child_id).await {
                Ok(child) => child_agents.push(child),
                Err(e) => {
                    let _ = tx
                        .send(RunEvent::Error { agent_id: Some(child_id.clone()), kind: e.kind(), message: e.to_string() })
                        .await;
                }
            }
        }

        if child_agents.is_empty() {
            return;
        }

        let mut new_path = path.to_vec();
        new_path.push(agent.agent_id.clone());

        let parallelism = child_agents.len().min(self.settings.max_parallel_per_run).max(1);
        let futures = child_agents.into_iter().map(|child| {
            let child_context = ExecutionContext {
                parent_output: Some(agent_output.to_string()),
                ..context.clone()
            };
            self.execute(
                child,
                agent_output.to_string(),
                child_context,
                depth + 1,
                new_path.clone(),
                cancel.clone(),
                tx.clone(),
            )
        });
        stream::iter(futures).buffer_unordered(parallelism).collect::<Vec<()>>().await;
    }

    fn build_system_prompt(&self, agent: &Agent, context: &ExecutionContext) -> String {
        let children = context.snapshot.children_of(&agent.agent_id);
        let mut directive = String::from(
            "\n\nAct autonomously on the task below; do not ask the user for clarification or \
             further input. The following are immediate sub-agents available for this task, \
             listed for context only — the system will engage them when appropriate:\n",
        );
        if children.is_empty() {
            directive.push_str("(none)\n");
        } else {
            for child in children {
                let keywords: Vec<&str> = child.keywords.iter().map(|k| k.as_str()).collect();
                directive.push_str(&format!("- {}: {}\n", child.agent_id, keywords.join(", ")));
            }
        }
        format!("{}{}", agent.system_prompt, directive)
    }

    fn build_user_prompt(&self, task: &str, context: &ExecutionContext) -> String {
        let mut parts = Vec::new();
        let history_start = context.conversation_history.len().saturating_sub(HISTORY_WINDOW);
        parts.extend(context.conversation_history[history_start..].iter().cloned());
        if let Some(parent_output) = &context.parent_output {
            parts.push(parent_output.clone());
        }
        parts.push(task.to_string());
        parts.join("\n\n")
    }

    async fn stream_agent(
        &self,
        agent: &Agent,
        context: &ExecutionContext,
        system_prompt: String,
        user_prompt: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<RunEvent>,
    ) -> StreamOutcome {
        let agent_cancel = cancel.child_token();
        let request = GenerationRequest {
            agent_id: agent.agent_id.clone(),
            api_key: context.api_key.clone(),
            model: agent.parameters.model.clone(),
            system_prompt,
            user_prompt,
            images: if agent.photo_injection_enabled { context.images.clone() } else { Vec::new() },
            temperature: agent.parameters.temperature,
            max_tokens: agent.parameters.max_tokens,
        };

        let agent_id = agent.agent_id.clone();
        // Lives outside `body` so a timeout (which drops `body` mid-poll) still
        // leaves the chunks streamed so far readable below.
        let accumulated = Arc::new(StdMutex::new(String::new()));
        let body = {
            let accumulated = accumulated.clone();
            async move {
                let mut stream = match self.llm.generate_stream(request, agent_cancel.clone()).await {
                    Ok(stream) => stream,
                    Err(e) => return Some(e),
                };
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(StreamItem::Chunk(text)) => {
                            let _ = tx.send(RunEvent::OutputChunk { agent_id: agent_id.clone(), text: text.clone() }).await;
                            accumulated.lock().unwrap().push_str(&text);
                        }
                        Ok(StreamItem::Done(_)) => break,
                        Err(e @ (OrchestratorError::EmptyCompletion | OrchestratorError::BlockedByPolicy)) => {
                            let notice = synthetic_empty_completion_notice().to_string();
                            let _ = tx.send(RunEvent::OutputChunk { agent_id: agent_id.clone(), text: notice.clone() }).await;
                            accumulated.lock().unwrap().push_str(&notice);
                            break;
                        }
                        Err(e) => return Some(e),
                    }
                }
                None
            }
        };

        match tokio::time::timeout(self.settings.agent_timeout, body).await {
            Ok(None) => StreamOutcome::Completed(accumulated.lock().unwrap().clone()),
            Ok(Some(err)) => StreamOutcome::Failed(accumulated.lock().unwrap().clone(), err),
            Err(_elapsed) => {
                agent_cancel.cancel();
                StreamOutcome::TimedOut(accumulated.lock().unwrap().clone())
            }
        }
    }

    async fn circuit_open(&self, agent_id: &str) -> bool {
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.entry(agent_id.to_string()).or_default();
        let now = Instant::now();
        entry.failures.retain(|t| now.duration_since(*t) < CIRCUIT_FAILURE_WINDOW);
        entry.failures.len() >= CIRCUIT_FAILURE_THRESHOLD
    }

    async fn record_failure(&self, agent_id: &str) {
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.entry(agent_id.to_string()).or_default();
        entry.failures.push_back(Instant::now());
        if entry.failures.len() >= CIRCUIT_FAILURE_THRESHOLD {
            warn!(agent_id, "circuit breaker opened after repeated failures");
        }
    }
}

enum StreamOutcome {
    Completed(String),
    TimedOut(String),
    Failed(String, OrchestratorError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlm, MockResponse};
    use crate::model::{AgentParameters, Capability};
    use crate::repository::InMemoryAgentRepository;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn agent(id: &str, parent: Option<&str>) -> Agent {
        Agent {
            agent_id: id.to_string(),
            session_id: "s1".to_string(),
            name: id.to_string(),
            role: "tester".to_string(),
            system_prompt: "be helpful".to_string(),
            parameters: AgentParameters { model: "test-model".to_string(), temperature: 0.0, max_tokens: 200 },
            photo_injection_enabled: false,
            photo_injection_features: vec![],
            parent_id: parent.map(|p| p.to_string()),
            canvas_position: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn empty_snapshot(root_id: &str) -> Arc<AgentTreeSnapshot> {
        let mut capability_map = StdHashMap::new();
        capability_map.insert(
            root_id.to_string(),
            Capability { agent_id: root_id.to_string(), keywords: Default::default(), child_capabilities: vec![], depth: 0, confidence: 1.0 },
        );
        Arc::new(AgentTreeSnapshot {
            session_id: "s1".to_string(),
            root_agent_id: root_id.to_string(),
            capability_map,
            agent_count: 1,
            max_depth: 0,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
        })
    }

    fn context(snapshot: Arc<AgentTreeSnapshot>) -> ExecutionContext {
        ExecutionContext {
            parent_output: None,
            conversation_history: vec![],
            images: vec![],
            api_key: "key".to_string(),
            snapshot,
            run_id: "r1".to_string(),
            session_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn single_agent_produces_output_then_completed_status() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let root = agent("root", None);
        repo.insert_agent(root.clone()).await;
        let llm = Arc::new(MockLlm::new(MockResponse::Chunks(vec!["hello".to_string()])));
        let executor = Executor::new(llm, repo, settings());

        let (tx, mut rx) = mpsc::channel(32);
        executor
            .execute(root.clone(), "hi".to_string(), context(empty_snapshot("root")), 0, vec![], CancellationToken::new(), tx)
            .await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(events.iter().any(|e| matches!(e, RunEvent::Output { text, .. } if text == "hello")));
        assert!(matches!(events.last(), Some(RunEvent::Status { state: AgentStatus::Completed, .. })));
    }

    #[tokio::test]
    async fn cycle_in_path_is_refused() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let root = agent("root", None);
        repo.insert_agent(root.clone()).await;
        let llm = Arc::new(MockLlm::echo());
        let executor = Executor::new(llm, repo, settings());

        let (tx, mut rx) = mpsc::channel(8);
        executor
            .execute(root.clone(), "hi".to_string(), context(empty_snapshot("root")), 0, vec!["root".to_string()], CancellationToken::new(), tx)
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RunEvent::DelegationRefused { reason: DelegationRefusalReason::Cycle, .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn depth_at_max_is_refused() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let root = agent("root", None);
        repo.insert_agent(root.clone()).await;
        let llm = Arc::new(MockLlm::echo());
        let mut s = Settings::default();
        s.max_depth = 2;
        let executor = Executor::new(llm, repo, Arc::new(s));

        let (tx, mut rx) = mpsc::channel(8);
        executor
            .execute(root.clone(), "hi".to_string(), context(empty_snapshot("root")), 2, vec![], CancellationToken::new(), tx)
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RunEvent::DelegationRefused { reason: DelegationRefusalReason::Depth, .. }));
    }

    #[tokio::test]
    async fn timeout_emits_timeout_event_with_partial_text() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let root = agent("root", None);
        repo.insert_agent(root.clone()).await;
        let llm = Arc::new(MockLlm::new(MockResponse::HangAfterFirstChunk("partial".to_string())));
        let mut s = Settings::default();
        s.agent_timeout = Duration::from_millis(50);
        let executor = Executor::new(llm, repo, Arc::new(s));

        let (tx, mut rx) = mpsc::channel(32);
        executor
            .execute(root.clone(), "hi".to_string(), context(empty_snapshot("root")), 0, vec![], CancellationToken::new(), tx)
            .await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(e, RunEvent::Timeout { .. })));
        assert!(events.iter().any(|e| matches!(e, RunEvent::Output { text, .. } if text == "partial")));
    }
}
