//! Keyword extraction for one agent's capability node (`spec.md` §4.3:
//! "call C1 with a short analysis prompt to extract 3–7 capability
//! keywords from `name + role + system_prompt`").

use std::collections::HashSet;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::llm::{GenerationRequest, LlmClient, StreamItem};
use crate::model::{tokenize_keywords, Agent};

const ANALYSIS_SYSTEM_PROMPT: &str =
    "You extract short capability keywords for an AI agent. Reply with 3 to 7 \
     comma-separated lowercase keywords and nothing else.";

/// Calls C1 with a short analysis prompt and parses 3–7 comma- or
/// newline-separated keywords out of the response.
pub async fn extract_capability_keywords(
    llm: &(impl LlmClient + ?Sized),
    api_key: &str,
    agent: &Agent,
) -> Result<HashSet<String>, OrchestratorError> {
    let user_prompt = format!(
        "name: {}\nrole: {}\nsystem_prompt: {}",
        agent.name, agent.role, agent.system_prompt
    );

    let request = GenerationRequest {
        agent_id: agent.agent_id.clone(),
        api_key: api_key.to_string(),
        model: agent.parameters.model.clone(),
        system_prompt: ANALYSIS_SYSTEM_PROMPT.to_string(),
        user_prompt,
        images: vec![],
        temperature: 0.0,
        max_tokens: 64,
    };

    let mut stream = llm
        .generate_stream(request, CancellationToken::new())
        .await?;

    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item? {
            StreamItem::Chunk(chunk) => text.push_str(&chunk),
            StreamItem::Done(_) => break,
        }
    }

    if text.trim().is_empty() {
        return Err(OrchestratorError::EmptyCompletion);
    }

    let keywords: HashSet<String> = text
        .split([',', '\n'])
        .flat_map(|part| tokenize_keywords(part))
        .take(7)
        .collect();

    if keywords.is_empty() {
        return Err(OrchestratorError::EmptyCompletion);
    }

    Ok(keywords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlm, MockResponse};
    use crate::model::AgentParameters;
    use chrono::Utc;

    fn sample_agent() -> Agent {
        Agent {
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
            name: "Travel Planner".to_string(),
            role: "plans trips".to_string(),
            system_prompt: "You plan flights and hotels.".to_string(),
            parameters: AgentParameters {
                model: "test-model".to_string(),
                temperature: 0.0,
                max_tokens: 100,
            },
            photo_injection_enabled: false,
            photo_injection_features: vec![],
            parent_id: None,
            canvas_position: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn parses_comma_separated_keywords() {
        let llm = MockLlm::new(MockResponse::Chunks(vec![
            "flights, hotels, itinerary, budget".to_string(),
        ]));
        let keywords = extract_capability_keywords(&llm, "key", &sample_agent())
            .await
            .unwrap();
        assert!(keywords.contains("flights"));
        assert!(keywords.contains("hotels"));
        assert!(keywords.len() <= 7);
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let llm = MockLlm::new(MockResponse::EmptyCompletion);
        let err = extract_capability_keywords(&llm, "key", &sample_agent())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyCompletion));
    }
}
