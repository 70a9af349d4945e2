//! Agent Tree Cache (C3, `spec.md` §4.3): materializes the capability
//! snapshot for a `(session_id, root_id)` pair, coalescing concurrent
//! first-time builds onto a single in-flight build and invalidating
//! explicitly on every mutation path — there is no time-based TTL, unlike a
//! generic cache: a `Cache<K, V>` trait keyed on expiry does not fit a
//! mutation-invalidated snapshot (see `DESIGN.md`).

mod capability;

pub use capability::extract_capability_keywords;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::llm::LlmClient;
use crate::model::{Agent, AgentId, AgentTreeSnapshot, Capability, SessionId};
use crate::repository::AgentRepository;

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("agent tree snapshot unavailable: {0}")]
    Unavailable(String),
}

type Key = (SessionId, AgentId);

struct InFlight {
    done_tx: watch::Sender<bool>,
}

/// Per-(session, root) snapshot cache. The sole mutable global state of the
/// orchestrator (`spec.md` §5): readers take the `snapshots` lock briefly;
/// builders hold the `in_flight` lock only long enough to register or join a
/// build slot, then release it while the (slow, LLM-calling) build runs.
pub struct TreeCache<R, L> {
    repository: Arc<R>,
    llm: Arc<L>,
    snapshots: Mutex<HashMap<Key, AgentTreeSnapshot>>,
    in_flight: Mutex<HashMap<Key, InFlight>>,
    last_error: Mutex<HashMap<Key, BuildError>>,
}

impl<R, L> TreeCache<R, L>
where
    R: AgentRepository + Send + Sync + 'static,
    L: LlmClient + Send + Sync + 'static,
{
    pub fn new(repository: Arc<R>, llm: Arc<L>) -> Self {
        Self {
            repository,
            llm,
            snapshots: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            last_error: Mutex::new(HashMap::new()),
        }
    }

    /// `get_or_build(session_id, root_id, api_key) -> Snapshot` (`spec.md` §4.3).
    pub async fn get_or_build(
        &self,
        session_id: &str,
        root_id: &str,
        api_key: &str,
    ) -> Result<AgentTreeSnapshot, BuildError> {
        let key = (session_id.to_string(), root_id.to_string());

        loop {
            if let Some(snapshot) = self.touch(&key).await {
                return Ok(snapshot);
            }

            let mut become_builder = false;
            let mut joined: Option<watch::Receiver<bool>> = None;
            {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(existing) = in_flight.get(&key) {
                    joined = Some(existing.done_tx.subscribe());
                } else {
                    let (tx, _rx) = watch::channel(false);
                    in_flight.insert(key.clone(), InFlight { done_tx: tx });
                    become_builder = true;
                }
            }

            if become_builder {
                let result = self.build(session_id, root_id, api_key).await;
                self.finish_build(&key, result.clone()).await;
                return result;
            }

            if let Some(mut rx) = joined {
                let _ = rx.changed().await;
                if let Some(err) = self.last_error.lock().await.get(&key).cloned() {
                    return Err(err);
                }
                // loop back around: the builder populated `snapshots`.
                continue;
            }
        }
    }

    /// `invalidate(session_id, root_id?)` (`spec.md` §4.3): removes affected
    /// snapshots. With no `root_id`, clears every snapshot rooted in the
    /// session — any mutation reported through C2 triggers this for the
    /// containing session.
    pub async fn invalidate(&self, session_id: &str, root_id: Option<&str>) {
        let mut snapshots = self.snapshots.lock().await;
        let mut last_error = self.last_error.lock().await;
        snapshots.retain(|(sid, rid), _| {
            !(sid == session_id && root_id.map(|r| r == rid).unwrap_or(true))
        });
        last_error.retain(|(sid, rid), _| {
            !(sid == session_id && root_id.map(|r| r == rid).unwrap_or(true))
        });
        info!(session_id, root_id, "tree cache invalidated");
    }

    async fn touch(&self, key: &Key) -> Option<AgentTreeSnapshot> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some(snap) = snapshots.get_mut(key) {
            snap.last_accessed = Utc::now();
            return Some(snap.clone());
        }
        None
    }

    async fn finish_build(&self, key: &Key, result: Result<AgentTreeSnapshot, BuildError>) {
        match &result {
            Ok(snapshot) => {
                self.snapshots
                    .lock()
                    .await
                    .insert(key.clone(), snapshot.clone());
                self.last_error.lock().await.remove(key);
            }
            Err(err) => {
                self.last_error.lock().await.insert(key.clone(), err.clone());
            }
        }
        // Remove the in-flight slot and wake every waiter subscribed to it.
        if let Some(entry) = self.in_flight.lock().await.remove(key) {
            let _ = entry.done_tx.send(true);
        }
    }

    async fn build(
        &self,
        session_id: &str,
        root_id: &str,
        api_key: &str,
    ) -> Result<AgentTreeSnapshot, BuildError> {
        let agents = self
            .repository
            .get_agent_subtree(session_id, root_id)
            .await
            .map_err(|e| BuildError::Unavailable(e.to_string()))?;

        if agents.iter().all(|a| a.agent_id != root_id) {
            return Err(BuildError::Unavailable(format!(
                "root agent {root_id} not found in session {session_id}"
            )));
        }

        let mut by_parent: HashMap<Option<AgentId>, Vec<&Agent>> = HashMap::new();
        for agent in &agents {
            by_parent.entry(agent.parent_id.clone()).or_default().push(agent);
        }

        let mut capability_map = HashMap::new();
        let mut max_depth = 0u32;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(root_id.to_string());

        let mut depths: HashMap<AgentId, u32> = HashMap::new();
        depths.insert(root_id.to_string(), 0);

        while let Some(agent_id) = queue.pop_front() {
            let Some(agent) = agents.iter().find(|a| a.agent_id == agent_id) else {
                continue;
            };
            let depth = *depths.get(&agent_id).unwrap_or(&0);
            max_depth = max_depth.max(depth);

            let (keywords, confidence) =
                match extract_capability_keywords(self.llm.as_ref(), api_key, agent).await {
                    Ok(kw) => (kw, 1.0),
                    Err(e) => {
                        warn!(
                            agent_id = %agent.agent_id,
                            error = %e,
                            "capability extraction failed, falling back to role tokens"
                        );
                        (crate::model::tokenize_keywords(&agent.role), 0.3)
                    }
                };

            let children: Vec<AgentId> = by_parent
                .get(&Some(agent_id.clone()))
                .into_iter()
                .flatten()
                .map(|a| a.agent_id.clone())
                .collect();

            for child_id in &children {
                depths.insert(child_id.clone(), depth + 1);
                queue.push_back(child_id.clone());
            }

            capability_map.insert(
                agent_id.clone(),
                Capability {
                    agent_id: agent_id.clone(),
                    keywords,
                    // filled in below once every node's own capability exists.
                    child_capabilities: children
                        .iter()
                        .map(|c| Capability {
                            agent_id: c.clone(),
                            keywords: Default::default(),
                            child_capabilities: vec![],
                            depth: depth + 1,
                            confidence: 0.0,
                        })
                        .collect(),
                    depth,
                    confidence,
                },
            );
        }

        // second pass: hydrate each node's `child_capabilities` with the real,
        // fully-built child entries now that every node exists in the map.
        let snapshot_ids: Vec<AgentId> = capability_map.keys().cloned().collect();
        for id in snapshot_ids {
            let child_ids: Vec<AgentId> = capability_map[&id]
                .child_capabilities
                .iter()
                .map(|c| c.agent_id.clone())
                .collect();
            let hydrated: Vec<Capability> = child_ids
                .iter()
                .filter_map(|cid| capability_map.get(cid).cloned())
                .collect();
            capability_map.get_mut(&id).unwrap().child_capabilities = hydrated;
        }

        let now = Utc::now();
        Ok(AgentTreeSnapshot {
            session_id: session_id.to_string(),
            root_agent_id: root_id.to_string(),
            agent_count: capability_map.len(),
            capability_map,
            max_depth,
            created_at: now,
            last_accessed: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlm, MockResponse};
    use crate::model::{Agent, AgentParameters};
    use crate::repository::InMemoryAgentRepository;
    use chrono::Utc;

    fn agent(id: &str, parent: Option<&str>, role: &str) -> Agent {
        Agent {
            agent_id: id.to_string(),
            session_id: "s1".to_string(),
            name: id.to_string(),
            role: role.to_string(),
            system_prompt: format!("You are {id}."),
            parameters: AgentParameters {
                model: "test-model".to_string(),
                temperature: 0.0,
                max_tokens: 256,
            },
            photo_injection_enabled: false,
            photo_injection_features: vec![],
            parent_id: parent.map(|p| p.to_string()),
            canvas_position: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn seeded_repo() -> InMemoryAgentRepository {
        let repo = InMemoryAgentRepository::new();
        repo.insert_agent(agent("root", None, "planner")).await;
        repo.insert_agent(agent("child", Some("root"), "researcher")).await;
        repo
    }

    #[tokio::test]
    async fn builds_a_snapshot_with_depth_and_count() {
        let repo = Arc::new(seeded_repo().await);
        let llm = Arc::new(
            MockLlm::new(MockResponse::Chunks(vec!["alpha, beta, gamma".to_string()])),
        );
        let cache = TreeCache::new(repo, llm);

        let snapshot = cache.get_or_build("s1", "root", "key").await.unwrap();
        assert_eq!(snapshot.agent_count, 2);
        assert_eq!(snapshot.max_depth, 1);
        assert!(snapshot.capability_map.contains_key("child"));
    }

    #[tokio::test]
    async fn second_call_returns_cached_snapshot_with_later_access_time() {
        let repo = Arc::new(seeded_repo().await);
        let llm = Arc::new(MockLlm::echo());
        let cache = TreeCache::new(repo, llm);

        let first = cache.get_or_build("s1", "root", "key").await.unwrap();
        let second = cache.get_or_build("s1", "root", "key").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_accessed >= first.last_accessed);
    }

    #[tokio::test]
    async fn invalidate_forces_a_rebuild_with_a_later_created_at() {
        let repo = Arc::new(seeded_repo().await);
        let llm = Arc::new(MockLlm::echo());
        let cache = TreeCache::new(repo, llm);

        let first = cache.get_or_build("s1", "root", "key").await.unwrap();
        cache.invalidate("s1", None).await;
        let second = cache.get_or_build("s1", "root", "key").await.unwrap();
        assert!(second.created_at > first.created_at);
    }

    #[tokio::test]
    async fn unknown_root_is_reported_as_unavailable() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let llm = Arc::new(MockLlm::echo());
        let cache = TreeCache::new(repo, llm);

        let err = cache.get_or_build("s1", "missing", "key").await.unwrap_err();
        assert!(matches!(err, BuildError::Unavailable(_)));
    }
}
