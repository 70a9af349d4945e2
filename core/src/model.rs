//! Data model (`spec.md` §3): Session, Agent, Link, Run, Capability, AgentTreeSnapshot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type AgentId = String;
pub type RunId = String;

/// Isolation boundary owning a set of agents, links, and runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Generation parameters for one agent's LLM calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentParameters {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A named LLM persona with a system prompt, generation parameters, and optional parent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    pub parameters: AgentParameters,
    pub photo_injection_enabled: bool,
    pub photo_injection_features: Vec<String>,
    pub parent_id: Option<AgentId>,
    pub canvas_position: Option<(f32, f32)>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Redundant edge materialization of `Agent::parent_id`; `parent_id` is authoritative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub session_id: SessionId,
    pub parent_id: AgentId,
    pub child_id: AgentId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Run request payload (`spec.md` §6: "Run request").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunInput {
    pub prompt: Option<String>,
    pub task: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<String>,
}

impl RunInput {
    /// The effective task string at the root: `task` if present, else `prompt`.
    pub fn effective_task(&self) -> String {
        self.task
            .clone()
            .or_else(|| self.prompt.clone())
            .unwrap_or_default()
    }
}

/// `run.output`: `{ final: string, agents: map<agent_id, string> }` (`spec.md` §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunOutput {
    pub final_output: String,
    pub per_agent_output: HashMap<AgentId, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One append-only run log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub agent_id: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

/// One execution of a root agent against a user task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub root_agent_id: AgentId,
    pub status: RunStatus,
    pub input: RunInput,
    pub output: Option<RunOutput>,
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Derived, cached capability keywords for one agent within a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Capability {
    pub agent_id: AgentId,
    pub keywords: HashSet<String>,
    pub child_capabilities: Vec<Capability>,
    pub depth: u32,
    pub confidence: f32,
}

/// Per-(session, root) snapshot of an agent subtree with derived capabilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentTreeSnapshot {
    pub session_id: SessionId,
    pub root_agent_id: AgentId,
    pub capability_map: HashMap<AgentId, Capability>,
    pub agent_count: usize,
    pub max_depth: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl AgentTreeSnapshot {
    pub fn root_capability(&self) -> Option<&Capability> {
        self.capability_map.get(&self.root_agent_id)
    }

    pub fn children_of<'a>(&'a self, agent_id: &AgentId) -> Vec<&'a Capability> {
        self.capability_map
            .get(agent_id)
            .map(|cap| {
                cap.child_capabilities
                    .iter()
                    .filter_map(|child| self.capability_map.get(&child.agent_id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Case-folded, punctuation-stripped token set, shared by C3's fallback
/// keyword derivation and C4's `keyword_match` scoring so both sides of the
/// router agree on what counts as a "word" (`spec.md` §4.4).
pub fn tokenize_keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.to_lowercase())
        .collect()
}
