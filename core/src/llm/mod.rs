//! LLM Streaming Client (C1, `spec.md` §4.1): a lazy, finite, cancellable
//! sequence of text chunks from a remote provider.

mod http;
mod mock;

pub use http::HttpLlm;
pub use mock::{MockLlm, MockResponse};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;

/// One call's worth of generation parameters.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub agent_id: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub images: Vec<Vec<u8>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Why a chunk stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

/// One item yielded by a generation stream: either a non-empty text chunk,
/// or the terminal signal carrying the finish reason.
#[derive(Clone, Debug)]
pub enum StreamItem {
    Chunk(String),
    Done(FinishReason),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamItem, OrchestratorError>> + Send>>;

/// Produces a lazy, finite, non-restartable sequence of text chunks from a
/// remote LLM, respecting cancellation (`spec.md` §4.1).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, OrchestratorError>;
}

/// `temperature` bound from `spec.md` §4.1 ("temperature ∈ [0, 2]").
pub fn validate_temperature(temperature: f32) -> Result<(), OrchestratorError> {
    if !(0.0..=2.0).contains(&temperature) {
        return Err(OrchestratorError::TransportFailure(format!(
            "temperature {temperature} out of range [0, 2]"
        )));
    }
    Ok(())
}

/// Operator-visible notice surfaced as a synthetic chunk when the provider
/// returns no content (`spec.md` §4.1: "this preserves the contract 'a
/// response exists'"). Exact wording is the implementer's choice (§9).
pub fn synthetic_empty_completion_notice() -> &'static str {
    "[no response was generated for this turn]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_bounds_are_enforced() {
        assert!(validate_temperature(0.0).is_ok());
        assert!(validate_temperature(2.0).is_ok());
        assert!(validate_temperature(2.1).is_err());
        assert!(validate_temperature(-0.1).is_err());
    }
}
