//! Scripted `LlmClient` for tests: no network, fully deterministic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ChunkStream, FinishReason, GenerationRequest, LlmClient, StreamItem};
use crate::error::OrchestratorError;

/// Scripted behavior for one agent's call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yields each string as one chunk, then `Done(Stop)`.
    Chunks(Vec<String>),
    /// Yields the first chunk, then never yields again until cancelled —
    /// grounds end-to-end scenario 4 (timeout).
    HangAfterFirstChunk(String),
    /// Yields no chunks; caller surfaces the synthetic empty-completion notice.
    EmptyCompletion,
    /// Yields no chunks; caller surfaces the synthetic notice as well.
    BlockedByPolicy,
    /// Fails immediately with `TransportFailure`.
    TransportFailure,
}

/// Scripted `LlmClient`: one response per `agent_id`, falling back to a
/// default when an agent has no specific script.
pub struct MockLlm {
    responses: Mutex<HashMap<String, MockResponse>>,
    default: MockResponse,
}

impl MockLlm {
    pub fn new(default: MockResponse) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default,
        }
    }

    /// Convenience default: echoes the user prompt back as a single chunk.
    pub fn echo() -> Self {
        Self::new(MockResponse::Chunks(vec!["<echo>".to_string()]))
    }

    pub fn with_response(self, agent_id: impl Into<String>, response: MockResponse) -> Self {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .insert(agent_id.into(), response);
        self
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, OrchestratorError> {
        if request.api_key.is_empty() {
            return Err(OrchestratorError::MissingKey);
        }

        let response = self
            .responses
            .lock()
            .expect("mock lock poisoned")
            .get(&request.agent_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        if let MockResponse::TransportFailure = response {
            return Err(OrchestratorError::TransportFailure(
                "mock transport failure".to_string(),
            ));
        }

        let echoed = request.user_prompt.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            match response {
                MockResponse::Chunks(chunks) => {
                    let chunks = if chunks == vec!["<echo>".to_string()] {
                        vec![echoed]
                    } else {
                        chunks
                    };
                    for chunk in chunks {
                        if cancel.is_cancelled() {
                            return;
                        }
                        if tx.send(Ok(StreamItem::Chunk(chunk))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(StreamItem::Done(FinishReason::Stop))).await;
                }
                MockResponse::HangAfterFirstChunk(first) => {
                    if tx.send(Ok(StreamItem::Chunk(first))).await.is_err() {
                        return;
                    }
                    cancel.cancelled().await;
                }
                MockResponse::EmptyCompletion => {
                    let _ = tx.send(Err(OrchestratorError::EmptyCompletion)).await;
                }
                MockResponse::BlockedByPolicy => {
                    let _ = tx.send(Err(OrchestratorError::BlockedByPolicy)).await;
                }
                MockResponse::TransportFailure => unreachable!("handled above"),
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
