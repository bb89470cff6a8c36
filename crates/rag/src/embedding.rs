use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use finops_core::{HashEmbedder, HashEmbedderConfig, RetryPolicy};

use crate::builder::CancelToken;
use crate::config::{EmbeddingConfig, ProviderKind, RagConfig};
use crate::error::{ProviderError, RagError, Result};

/// A remote or local service that turns texts into vectors.
///
/// One call is one provider request; batching and retries live in [`Embedder`].
pub trait EmbeddingProvider: Send + Sync {
    /// Identity recorded in the index header, e.g. `hash:256` or
    /// `openai:text-embedding-3-small`. Vectors are only reused across builds
    /// when this matches exactly.
    fn name(&self) -> &str;

    /// Vector length, when known without calling the provider.
    fn dimensions(&self) -> Option<usize> {
        None
    }

    fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

pub struct HashProvider {
    name: String,
    dimensions: usize,
    embedder: HashEmbedder,
}

impl HashProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            name: format!("hash:{dimensions}"),
            dimensions,
            embedder: HashEmbedder::new(HashEmbedderConfig {
                dimensions,
                ..HashEmbedderConfig::default()
            }),
        }
    }
}

impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }

    fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs
            .iter()
            .map(|text| self.embedder.embed_text(text))
            .collect())
    }
}

pub struct OpenAiEmbeddingClient {
    http: Client,
    name: String,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            name: format!("openai:{}", config.model),
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn decode(&self, response: Response, expected: usize) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().unwrap_or_default();
            let message = format!("openai embeddings returned {status}: {}", truncate(&body, 200));
            return Err(if is_transient_status(status) {
                ProviderError::transient(message).with_retry_after(retry_after)
            } else {
                ProviderError::permanent(message)
            });
        }
        let mut parsed: OpenAiEmbeddingResponse = response
            .json()
            .map_err(|e| ProviderError::permanent(format!("failed to decode embeddings: {e}")))?;
        if parsed.data.len() != expected {
            return Err(ProviderError::permanent(format!(
                "openai returned {} embeddings for {expected} inputs",
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl EmbeddingProvider for OpenAiEmbeddingClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    ProviderError::transient(format!("openai embeddings request failed: {err}"))
                } else {
                    ProviderError::permanent(format!("openai embeddings request failed: {err}"))
                }
            })?;
        self.decode(response, inputs.len())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Batching, retrying front end over an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    batch_size: usize,
    max_concurrent_batches: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            batch_size: 64,
            max_concurrent_batches: 1,
        }
    }

    pub fn from_config(config: &RagConfig) -> Result<Self> {
        let embedding = &config.embedding;
        let provider: Arc<dyn EmbeddingProvider> = match embedding.provider {
            ProviderKind::Hash => Arc::new(HashProvider::new(embedding.hash_dimensions)),
            ProviderKind::OpenAi => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    RagError::Config("OPENAI_API_KEY is required for openai embeddings".into())
                })?;
                Arc::new(OpenAiEmbeddingClient::new(embedding, api_key)?)
            }
        };
        Ok(Self::new(provider, config.retry.clone())
            .with_batch_size(embedding.batch_size)
            .with_concurrency(embedding.max_concurrent_batches))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, max_concurrent_batches: usize) -> Self {
        self.max_concurrent_batches = max_concurrent_batches.max(1);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.provider.dimensions()
    }

    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_with_cancel(texts, &CancelToken::default())
    }

    /// Embeds `texts` in provider-sized batches, running up to
    /// `max_concurrent_batches` batches at a time. Output order matches input.
    pub fn embed_with_cancel(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for (wave_idx, wave) in batches.chunks(self.max_concurrent_batches).enumerate() {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            debug!(
                provider = self.provider.name(),
                wave = wave_idx,
                batches = wave.len(),
                "embedding wave"
            );
            let results: Vec<Vec<Vec<f32>>> = if wave.len() == 1 {
                vec![self.embed_batch(wave[0])?]
            } else {
                wave.par_iter()
                    .map(|batch| self.embed_batch(batch))
                    .collect::<std::result::Result<Vec<_>, ProviderError>>()?
            };
            vectors.extend(results.into_iter().flatten());
        }
        check_dimensions(&vectors)?;
        Ok(vectors)
    }

    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut output = self.embed_batch(&[text.to_string()])?;
        let vector = output
            .pop()
            .ok_or_else(|| ProviderError::permanent("provider returned no embedding"))?;
        Ok(vector)
    }

    fn embed_batch(&self, batch: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        self.retry.run("embed_batch", |attempt| {
            if attempt > 1 {
                debug!(attempt, size = batch.len(), "retrying embedding batch");
            }
            let output = self.provider.embed_batch(batch)?;
            if output.len() != batch.len() {
                return Err(ProviderError::permanent(format!(
                    "provider returned {} vectors for {} inputs",
                    output.len(),
                    batch.len()
                )));
            }
            if output.iter().any(|v| v.is_empty()) {
                return Err(ProviderError::permanent("provider returned an empty vector"));
            }
            Ok(output)
        })
    }
}

fn check_dimensions(vectors: &[Vec<f32>]) -> Result<()> {
    if let Some(first) = vectors.first() {
        let expected = first.len();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }
    }
    Ok(())
}
