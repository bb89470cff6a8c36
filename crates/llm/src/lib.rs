use anyhow::{anyhow, bail, ensure, Context, Result};
use reqwest::{header::HeaderValue, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use tokio::runtime::Runtime;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use finops_core::RetryPolicy;

pub const CONTEXT_MARKER: &str = "Context (rows):";
pub const QUESTION_MARKER: &str = "User question:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Local => "local-extractive",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    retry: RetryPolicy,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAi(OpenAiConfig),
    Local,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("failed to build http client")?;
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: openai_key_from_env()?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            retry: RetryPolicy::default(),
            config,
        })
    }

    /// Builds a client from a provider name and optional model, falling back
    /// to the provider's default model.
    pub fn from_names(provider: &str, model: Option<&str>) -> Result<Self> {
        let provider = LlmProvider::from_str(provider)
            .ok_or_else(|| anyhow!("unknown generation provider {provider:?}"))?;
        let model = model
            .map(str::to_string)
            .unwrap_or_else(|| provider.default_model().to_string());
        Self::new(provider, model)
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req).await,
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }
    }

    /// Runs [`chat`](Self::chat) on a private runtime. Call from plain threads
    /// or `spawn_blocking`, never from inside an async task.
    pub fn chat_blocking(&self, req: &LlmRequest) -> Result<LlmResponse> {
        if let ProviderConfig::Local = self.config {
            return Ok(self.chat_local(req));
        }
        let rt = Runtime::new().context("failed to create tokio runtime")?;
        rt.block_on(self.chat(req))
    }

    async fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system }));
        }
        messages.push(json!({"role": "user", "content": req.user }));
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
        });
        let max_attempts = self.retry.attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(&url)
                .bearer_auth(&cfg.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= max_attempts {
                        return Err(err).with_context(|| "openai request failed");
                    }
                    let wait = self.retry.delay_for(attempt, None);
                    warn!(attempt, ?wait, error = %err, "openai request failed, retrying");
                    sleep(wait).await;
                    continue;
                }
            };
            let status = response.status();
            if is_retryable_status(status) {
                if attempt >= max_attempts {
                    return Err(anyhow!("openai returned {status} after {attempt} attempts"));
                }
                let wait = self
                    .retry
                    .delay_for(attempt, parse_retry_after(response.headers().get("retry-after")));
                warn!(attempt, ?wait, %status, "openai throttled, retrying");
                sleep(wait).await;
                continue;
            }
            let body = response.text().await.context("failed to read openai response")?;
            if !status.is_success() {
                bail!("openai chat returned {status}: {}", body.chars().take(200).collect::<String>());
            }
            let completion: ChatCompletion =
                serde_json::from_str(&body).context("failed to decode openai response")?;
            debug!(model = %self.model, attempt, "openai chat completed");
            return completion.into_response();
        }
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        let content = synthesize_local_response(req);
        LlmResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<std::time::Duration> {
    let secs = value?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.max(1)))
}

/// Offline stand-in for a chat model: echoes the retrieved rows as an
/// extractive answer so the pipeline can run without credentials.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let question = section(&req.user, QUESTION_MARKER, "\n\n");
    let context = section(&req.user, CONTEXT_MARKER, QUESTION_MARKER);
    let rows: Vec<&str> = context
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('['))
        .collect();
    if rows.is_empty() {
        return format!(
            "I cannot answer \"{}\" from the dataset: no matching rows were retrieved.",
            summarize_text(&question, 40)
        );
    }
    let mut answer = format!(
        "Relevant rows for \"{}\":\n",
        summarize_text(&question, 40)
    );
    for row in &rows {
        answer.push_str("- ");
        answer.push_str(row);
        answer.push('\n');
    }
    let sources: Vec<&str> = rows
        .iter()
        .filter_map(|row| row.split(']').next())
        .map(|label| label.trim_start_matches('['))
        .collect();
    answer.push_str(&format!("Sources: rows {}", sources.join(", ")));
    answer
}

/// Text between `start` and the next `stop` (or the end), trimmed.
fn section(text: &str, start: &str, stop: &str) -> String {
    let Some((_, rest)) = text.split_once(start) else {
        return String::new();
    };
    let body = rest.split_once(stop).map_or(rest, |(head, _)| head);
    body.trim().to_string()
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn openai_key_from_env() -> Result<String> {
    let key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
    check_openai_key(&key)?;
    Ok(key)
}

fn check_openai_key(key: &str) -> Result<()> {
    ensure!(key.starts_with("sk-"), "OPENAI_API_KEY must start with 'sk-'");
    Ok(())
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl ChatCompletion {
    /// Message content is either a string or a list of typed parts.
    fn into_response(self) -> Result<LlmResponse> {
        let content = self
            .choices
            .into_iter()
            .next()
            .and_then(|choice| match choice.message.content {
                Value::String(text) => Some(text),
                Value::Array(parts) => parts
                    .iter()
                    .find_map(|part| part.get("text").and_then(Value::as_str))
                    .map(str::to_string),
                _ => None,
            })
            .ok_or_else(|| anyhow!("openai response carried no message text"))?;
        Ok(LlmResponse {
            content,
            prompt_tokens: self.usage.prompt_tokens,
            completion_tokens: self.usage.completion_tokens,
        })
    }
}
