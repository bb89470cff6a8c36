//! Hands an assembled context to a generative model.
//!
//! Only allowed queries reach this module: callers pass the sanitized text
//! from [`GuardDecision::Allow`](crate::guard::GuardDecision).

use finops_llm::{LlmClient, LlmRequest, LlmResponse, QUESTION_MARKER};
use serde::Serialize;

use crate::config::GenerationConfig;
use crate::error::{RagError, Result};

pub const SYSTEM_PROMPT: &str = "You are a helpful FinOps assistant. Use only the provided context and dataset snippets. \
When giving suggestions, provide 1-3 actionable next steps and include the sources (which rows you used). \
If the question is outside the dataset, answer briefly and say you cannot answer from data.";

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

pub fn build_request(context: &str, question: &str) -> LlmRequest {
    LlmRequest {
        system: Some(SYSTEM_PROMPT.to_string()),
        user: format!(
            "{context}\n\n{QUESTION_MARKER} {question}\n\n\
             Answer concisely, include the reasoning and list the context lines used as sources."
        ),
    }
}

pub fn client_from_config(config: &GenerationConfig) -> Result<LlmClient> {
    LlmClient::from_names(&config.provider, config.model.as_deref())
        .map_err(|e| RagError::Generation(format!("{e:#}")))
}

pub fn to_answer(client: &LlmClient, response: LlmResponse) -> GeneratedAnswer {
    GeneratedAnswer {
        answer: response.content.trim().to_string(),
        provider: client.provider().as_str().to_string(),
        model: client.model().to_string(),
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
    }
}

/// Blocking generation; use [`build_request`] with `LlmClient::chat` from async code.
pub fn generate_answer(client: &LlmClient, context: &str, question: &str) -> Result<GeneratedAnswer> {
    let request = build_request(context, question);
    let response = client
        .chat_blocking(&request)
        .map_err(|e| RagError::Generation(format!("{e:#}")))?;
    Ok(to_answer(client, response))
}
