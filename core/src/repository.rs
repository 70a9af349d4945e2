//! Agent Repository (C2, `spec.md` §4.2): session-scoped persistence for
//! agents, links, and runs. `InMemoryAgentRepository` is the only
//! implementation shipped here (grounded on the teacher's `Store`, which
//! wraps a lock around its backing storage rather than requiring `&mut
//! self` on every call); a durable backend can implement the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{Agent, AgentId, LogEntry, Run, RunId, RunInput, RunOutput, RunStatus, SessionId};

/// Session-scoped read/write of agent, link, and run records (`spec.md` §4.2).
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get_agent(&self, session_id: &str, agent_id: &str) -> Result<Agent, OrchestratorError>;

    async fn get_children(
        &self,
        session_id: &str,
        parent_id: &str,
    ) -> Result<Vec<Agent>, OrchestratorError>;

    /// The root agent plus every descendant, in no particular order; used by
    /// C3 to build a snapshot with a single call.
    async fn get_agent_subtree(
        &self,
        session_id: &str,
        root_id: &str,
    ) -> Result<Vec<Agent>, OrchestratorError>;

    async fn create_run(
        &self,
        session_id: &str,
        root_id: &str,
        input: RunInput,
    ) -> Result<Run, OrchestratorError>;

    async fn get_run(&self, session_id: &str, run_id: &str) -> Result<Run, OrchestratorError>;

    async fn update_run_status(
        &self,
        session_id: &str,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), OrchestratorError>;

    async fn append_run_log(
        &self,
        session_id: &str,
        run_id: &str,
        entry: LogEntry,
    ) -> Result<(), OrchestratorError>;

    async fn set_run_output(
        &self,
        session_id: &str,
        run_id: &str,
        output: RunOutput,
    ) -> Result<(), OrchestratorError>;
}

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    runs: HashMap<RunId, Run>,
}

/// In-memory `AgentRepository`: a single `RwLock<Tables>` for readers plus one
/// `Mutex` per run for the row-level write serialization `spec.md` §4.2 and
/// §5 require ("writers serialize per run via a row-level lock").
pub struct InMemoryAgentRepository {
    tables: RwLock<Tables>,
    run_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl Default for InMemoryAgentRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Test/seed helper: inserts an agent directly, bypassing session-isolation
    /// or cycle checks (those apply to the mutation API a graph editor would
    /// call, which is out of this crate's scope — see `DESIGN.md`).
    pub async fn insert_agent(&self, agent: Agent) {
        self.tables.write().await.agents.insert(agent.agent_id.clone(), agent);
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Walks `candidate_parent_id`'s ancestor chain; `true` if `id` appears in
    /// it, meaning re-parenting `id` under `candidate_parent_id` would create
    /// a cycle (`spec.md` §4.2).
    fn would_create_cycle(tables: &Tables, id: &str, candidate_parent_id: &str) -> bool {
        let mut current = Some(candidate_parent_id.to_string());
        while let Some(cur) = current {
            if cur == id {
                return true;
            }
            current = tables.agents.get(&cur).and_then(|a| a.parent_id.clone());
        }
        false
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn get_agent(&self, session_id: &str, agent_id: &str) -> Result<Agent, OrchestratorError> {
        let tables = self.tables.read().await;
        match tables.agents.get(agent_id) {
            Some(agent) if agent.session_id == session_id => Ok(agent.clone()),
            Some(_) => Err(OrchestratorError::CrossSessionViolation),
            None => Err(OrchestratorError::NotFound(format!("agent {agent_id}"))),
        }
    }

    async fn get_children(
        &self,
        session_id: &str,
        parent_id: &str,
    ) -> Result<Vec<Agent>, OrchestratorError> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .filter(|a| a.session_id == session_id && a.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn get_agent_subtree(
        &self,
        session_id: &str,
        root_id: &str,
    ) -> Result<Vec<Agent>, OrchestratorError> {
        let tables = self.tables.read().await;
        let Some(root) = tables.agents.get(root_id).filter(|a| a.session_id == session_id) else {
            return Err(OrchestratorError::NotFound(format!("agent {root_id}")));
        };

        let mut subtree = vec![root.clone()];
        let mut frontier = vec![root_id.to_string()];
        while let Some(parent_id) = frontier.pop() {
            for agent in tables.agents.values() {
                if agent.session_id == session_id && agent.parent_id.as_deref() == Some(parent_id.as_str()) {
                    subtree.push(agent.clone());
                    frontier.push(agent.agent_id.clone());
                }
            }
        }
        Ok(subtree)
    }

    async fn create_run(
        &self,
        session_id: &str,
        root_id: &str,
        input: RunInput,
    ) -> Result<Run, OrchestratorError> {
        {
            let tables = self.tables.read().await;
            match tables.agents.get(root_id) {
                Some(agent) if agent.session_id == session_id => {}
                Some(_) => return Err(OrchestratorError::CrossSessionViolation),
                None => return Err(OrchestratorError::NotFound(format!("agent {root_id}"))),
            }
        }

        let run = Run {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            root_agent_id: root_id.to_string(),
            status: RunStatus::Pending,
            input,
            output: None,
            logs: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        self.tables.write().await.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, session_id: &str, run_id: &str) -> Result<Run, OrchestratorError> {
        let tables = self.tables.read().await;
        match tables.runs.get(run_id) {
            Some(run) if run.session_id == session_id => Ok(run.clone()),
            Some(_) => Err(OrchestratorError::CrossSessionViolation),
            None => Err(OrchestratorError::NotFound(format!("run {run_id}"))),
        }
    }

    async fn update_run_status(
        &self,
        session_id: &str,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut tables = self.tables.write().await;
        let run = match tables.runs.get_mut(run_id) {
            Some(run) if run.session_id == session_id => run,
            Some(_) => return Err(OrchestratorError::CrossSessionViolation),
            None => return Err(OrchestratorError::NotFound(format!("run {run_id}"))),
        };

        let now = Utc::now();
        if run.started_at.is_none() && status == RunStatus::Running {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
        }
        run.status = status;
        run.error = error;
        Ok(())
    }

    async fn append_run_log(
        &self,
        session_id: &str,
        run_id: &str,
        entry: LogEntry,
    ) -> Result<(), OrchestratorError> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut tables = self.tables.write().await;
        let run = match tables.runs.get_mut(run_id) {
            Some(run) if run.session_id == session_id => run,
            Some(_) => return Err(OrchestratorError::CrossSessionViolation),
            None => return Err(OrchestratorError::NotFound(format!("run {run_id}"))),
        };
        run.logs.push(entry);
        Ok(())
    }

    async fn set_run_output(
        &self,
        session_id: &str,
        run_id: &str,
        output: RunOutput,
    ) -> Result<(), OrchestratorError> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut tables = self.tables.write().await;
        let run = match tables.runs.get_mut(run_id) {
            Some(run) if run.session_id == session_id => run,
            Some(_) => return Err(OrchestratorError::CrossSessionViolation),
            None => return Err(OrchestratorError::NotFound(format!("run {run_id}"))),
        };
        run.output = Some(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentParameters;

    fn agent(id: &str, session: &str, parent: Option<&str>) -> Agent {
        Agent {
            agent_id: id.to_string(),
            session_id: session.to_string(),
            name: id.to_string(),
            role: "tester".to_string(),
            system_prompt: "be helpful".to_string(),
            parameters: AgentParameters {
                model: "test-model".to_string(),
                temperature: 0.0,
                max_tokens: 100,
            },
            photo_injection_enabled: false,
            photo_injection_features: vec![],
            parent_id: parent.map(|p| p.to_string()),
            canvas_position: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cross_session_read_is_not_found_to_the_wrong_session() {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("a1", "s1", None)).await;
        let err = repo.get_agent("s2", "a1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CrossSessionViolation));
    }

    #[tokio::test]
    async fn subtree_collects_all_descendants() {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("root", "s1", None)).await;
        repo.insert_agent(agent("child", "s1", Some("root"))).await;
        repo.insert_agent(agent("grandchild", "s1", Some("child"))).await;
        let subtree = repo.get_agent_subtree("s1", "root").await.unwrap();
        assert_eq!(subtree.len(), 3);
    }

    #[tokio::test]
    async fn would_create_cycle_detects_self_ancestry() {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("a", "s1", None)).await;
        repo.insert_agent(agent("b", "s1", Some("a"))).await;
        let tables = repo.tables.read().await;
        assert!(InMemoryAgentRepository::would_create_cycle(&tables, "a", "b"));
        assert!(!InMemoryAgentRepository::would_create_cycle(&tables, "a", "a_unrelated"));
    }

    #[tokio::test]
    async fn create_run_then_transition_and_persist_output() {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("root", "s1", None)).await;
        let run = repo
            .create_run("s1", "root", RunInput { task: Some("do it".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        repo.update_run_status("s1", &run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        repo.set_run_output(
            "s1",
            &run.run_id,
            RunOutput { final_output: "done".into(), per_agent_output: HashMap::new() },
        )
        .await
        .unwrap();
        repo.update_run_status("s1", &run.run_id, RunStatus::Completed, None)
            .await
            .unwrap();

        let reloaded = repo.get_run("s1", &run.run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
        assert_eq!(reloaded.output.unwrap().final_output, "done");
        assert!(reloaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn run_from_another_session_is_a_cross_session_violation() {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("root", "s1", None)).await;
        let run = repo.create_run("s1", "root", RunInput::default()).await.unwrap();
        let err = repo.get_run("s2", &run.run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CrossSessionViolation));
    }
}
