//! The error taxonomy (`spec.md` §7): one enum, one variant per `Kind`.

use thiserror::Error;

/// Every failure mode named across C1–C6, carrying a stable `kind` (the enum
/// variant itself, via `Display`) and a human-readable message. Never holds
/// an API key or other secret in any field.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("missing API key")]
    MissingKey,

    #[error("transport failure calling the LLM provider: {0}")]
    TransportFailure(String),

    #[error("rate limited by the LLM provider{}", retry_after_suffix(.retry_after_ms))]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("blocked by provider policy")]
    BlockedByPolicy,

    #[error("provider returned an empty completion")]
    EmptyCompletion,

    #[error("operation timed out")]
    Timeout,

    #[error("re-parenting agent {agent_id} to {new_parent_id} would create a cycle")]
    WouldCreateCycle {
        agent_id: String,
        new_parent_id: String,
    },

    #[error("cross-session violation: entity belongs to a different session")]
    CrossSessionViolation,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cycle detected on delegation path for agent {0}")]
    CycleDetected(String),

    #[error("max recursion depth exceeded at agent {0}")]
    MaxDepthExceeded(String),

    #[error("agent tree snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("circuit open for agent {0}: too many recent failures")]
    CircuitOpen(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("run is not pending; already started or finished")]
    RunAlreadyStartedOrFinished,
}

fn retry_after_suffix(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(" (retry after {ms}ms)"),
        None => String::new(),
    }
}

impl OrchestratorError {
    /// The stable, machine-readable `kind` surfaced in `error` SSE frames and
    /// persisted `Run::error` values (`spec.md` §6, §7).
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::MissingKey => "MissingKey",
            OrchestratorError::TransportFailure(_) => "TransportFailure",
            OrchestratorError::RateLimited { .. } => "RateLimited",
            OrchestratorError::BlockedByPolicy => "BlockedByPolicy",
            OrchestratorError::EmptyCompletion => "EmptyCompletion",
            OrchestratorError::Timeout => "Timeout",
            OrchestratorError::WouldCreateCycle { .. } => "WouldCreateCycle",
            OrchestratorError::CrossSessionViolation => "CrossSessionViolation",
            OrchestratorError::NotFound(_) => "NotFound",
            OrchestratorError::CycleDetected(_) => "CycleDetected",
            OrchestratorError::MaxDepthExceeded(_) => "MaxDepthExceeded",
            OrchestratorError::SnapshotUnavailable(_) => "SnapshotUnavailable",
            OrchestratorError::CircuitOpen(_) => "CircuitOpen",
            OrchestratorError::ChannelClosed => "ChannelClosed",
            OrchestratorError::RunAlreadyStartedOrFinished => "RunAlreadyStartedOrFinished",
        }
    }

    /// Whether this failure, surfaced by C1 during one agent's LLM call,
    /// should fail only that agent rather than the whole run (§7 propagation
    /// policy: per-agent failures are isolated unless the root itself fails
    /// without producing any text).
    pub fn is_per_agent_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransportFailure(_)
                | OrchestratorError::RateLimited { .. }
                | OrchestratorError::BlockedByPolicy
                | OrchestratorError::EmptyCompletion
                | OrchestratorError::Timeout
                | OrchestratorError::CircuitOpen(_)
        )
    }
}
