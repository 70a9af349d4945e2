//! Real HTTP streaming client (C1, `spec.md` §4.1): an OpenAI-compatible
//! chat-completions SSE endpoint, consumed with `reqwest_eventsource` in the
//! idiom of the pack's own provider-streaming adapters.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChunkStream, FinishReason, GenerationRequest, LlmClient, StreamItem};
use crate::error::OrchestratorError;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    delta: ChatDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

/// An OpenAI-compatible chat-completions streaming client.
pub struct HttpLlm {
    client: Client,
    base_url: String,
    legacy_model_map: std::collections::HashMap<String, String>,
}

impl HttpLlm {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            legacy_model_map: std::collections::HashMap::new(),
        }
    }

    pub fn with_legacy_model_map(
        mut self,
        map: std::collections::HashMap<String, String>,
    ) -> Self {
        self.legacy_model_map = map;
        self
    }

    /// Model migration (`spec.md` §4.1): substitutes a known legacy model id
    /// for the configured current one before dispatch.
    fn resolve_model(&self, model: &str) -> String {
        self.legacy_model_map
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_event_source(
        &self,
        request: &GenerationRequest,
    ) -> Result<EventSource, OrchestratorError> {
        let model = self.resolve_model(&request.model);
        let body = ChatRequest {
            model: &model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };

        let req = self
            .client
            .post(self.endpoint())
            .bearer_auth(&request.api_key)
            .json(&body);

        EventSource::new(req)
            .map_err(|e| OrchestratorError::TransportFailure(format!("building request: {e}")))
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, OrchestratorError> {
        super::validate_temperature(request.temperature)?;
        if request.api_key.is_empty() {
            return Err(OrchestratorError::MissingKey);
        }

        let mut attempt = 0u32;
        let mut last_err;
        loop {
            match self.try_stream_once(&request, cancel.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e) => {
                    last_err = e;
                    let backoff = RETRY_BASE * 2u32.pow(attempt)
                        + Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    warn!(attempt, error = %last_err, "retrying LLM call after backoff");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        #[allow(unreachable_code)]
        {
            Err(last_err)
        }
    }
}

fn is_retryable(err: &OrchestratorError) -> bool {
    matches!(
        err,
        OrchestratorError::TransportFailure(_) | OrchestratorError::RateLimited { .. }
    )
}

impl HttpLlm {
    async fn try_stream_once(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, OrchestratorError> {
        let mut event_source = self.build_event_source(request)?;
        let agent_id = request.agent_id.clone();

        let chunk_stream = stream! {
            let mut saw_any_text = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(agent_id = %agent_id, "llm stream cancelled");
                        break;
                    }
                    next = event_source.next() => {
                        match next {
                            None => break,
                            Some(Ok(Event::Open)) => continue,
                            Some(Ok(Event::Message(message))) => {
                                if message.data == "[DONE]" {
                                    break;
                                }
                                match serde_json::from_str::<ChatChunk>(&message.data) {
                                    Ok(parsed) => {
                                        for choice in parsed.choices {
                                            if let Some(content) = choice.delta.content {
                                                if !content.is_empty() {
                                                    saw_any_text = true;
                                                    yield Ok(StreamItem::Chunk(content));
                                                }
                                            }
                                            if let Some(reason) = choice.finish_reason {
                                                let finish = match reason.as_str() {
                                                    "length" => FinishReason::Length,
                                                    "content_filter" => FinishReason::ContentFilter,
                                                    _ => FinishReason::Stop,
                                                };
                                                if !saw_any_text && finish == FinishReason::ContentFilter {
                                                    yield Err(OrchestratorError::BlockedByPolicy);
                                                } else if !saw_any_text {
                                                    yield Err(OrchestratorError::EmptyCompletion);
                                                } else {
                                                    yield Ok(StreamItem::Done(finish));
                                                }
                                                event_source.close();
                                                return;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        yield Err(OrchestratorError::TransportFailure(format!(
                                            "malformed provider chunk: {e}"
                                        )));
                                        break;
                                    }
                                }
                            }
                            Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                                let retry_after_ms = response
                                    .headers()
                                    .get("retry-after")
                                    .and_then(|v| v.to_str().ok())
                                    .and_then(|v| v.parse::<u64>().ok())
                                    .map(|secs| secs * 1000);
                                if status.as_u16() == 429 {
                                    yield Err(OrchestratorError::RateLimited { retry_after_ms });
                                } else {
                                    yield Err(OrchestratorError::TransportFailure(format!(
                                        "provider returned status {status}"
                                    )));
                                }
                                break;
                            }
                            Some(Err(e)) => {
                                yield Err(OrchestratorError::TransportFailure(e.to_string()));
                                break;
                            }
                        }
                    }
                }
            }
            if !saw_any_text {
                return;
            }
        };

        Ok(Box::pin(chunk_stream))
    }
}
