#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use finops_core::{HashEmbedder, HashEmbedderConfig, RetryPolicy};
use finops_rag::{
    ContextAssembler, Dataset, Embedder, EmbeddingProvider, GuardRules, IndexStore, InputGuard,
    ProviderError, RagEngine, Retriever, SearchParams, SourceRecord,
};

/// Deterministic provider whose failures are scripted per call.
pub struct ScriptedProvider {
    name: String,
    embedder: HashEmbedder,
    script: Mutex<VecDeque<Option<ProviderError>>>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    /// `None` entries succeed, `Some(err)` entries fail; once the script is
    /// exhausted every call succeeds.
    pub fn with_script(script: Vec<Option<ProviderError>>) -> Arc<Self> {
        Self::build(32, script)
    }

    /// A provider configured for another vector size, as after a model change.
    pub fn with_dimensions(dimensions: usize) -> Arc<Self> {
        Self::build(dimensions, Vec::new())
    }

    fn build(dimensions: usize, script: Vec<Option<ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name: format!("scripted:{dimensions}"),
            embedder: HashEmbedder::new(HashEmbedderConfig {
                dimensions,
                ..HashEmbedderConfig::default()
            }),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }

    pub fn push_failure(&self, err: ProviderError) {
        self.script.lock().push_back(Some(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn embedded_texts(&self) -> usize {
        self.batch_sizes.lock().iter().sum()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

impl EmbeddingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Some(err)) = self.script.lock().pop_front() {
            return Err(err);
        }
        self.batch_sizes.lock().push(inputs.len());
        Ok(inputs.iter().map(|text| self.embedder.embed_text(text)).collect())
    }
}

/// Maps texts onto four hand-picked axes: idle, active spend, service, advice.
pub struct KeywordProvider;

impl KeywordProvider {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        let mut mentions_service = false;
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| c.is_whitespace() || c == '|') {
            let token = token.trim_matches(|c: char| c == '?' || c == '.' || c == ',');
            match token {
                "idle" | "zero" | "unused" | "decommission" => v[0] += 1.0,
                t if t.starts_with("cost:") => match t["cost:".len()..].parse::<f64>() {
                    Ok(cost) if cost == 0.0 => v[0] += 1.0,
                    Ok(_) => v[1] += 1.0,
                    Err(_) => {}
                },
                t if t.starts_with("service") => mentions_service = true,
                t if t.starts_with("tip") => v[3] += 1.0,
                _ => {}
            }
        }
        if mentions_service {
            v[2] = 1.0;
        }
        v
    }
}

impl EmbeddingProvider for KeywordProvider {
    fn name(&self) -> &str {
        "keyword"
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs.iter().map(|text| Self::vector(text)).collect())
    }
}

pub fn embedder(provider: Arc<dyn EmbeddingProvider>) -> Embedder {
    Embedder::new(provider, RetryPolicy::immediate(3)).with_batch_size(4)
}

pub fn engine(provider: Arc<dyn EmbeddingProvider>, store_path: &Path, params: SearchParams) -> RagEngine {
    let embedder = embedder(provider);
    RagEngine::with_components(
        IndexStore::open(store_path).unwrap(),
        embedder.clone(),
        Retriever::new(embedder),
        InputGuard::new(&GuardRules::default()).unwrap(),
        ContextAssembler::chars(2000),
        params,
        vec!["Tag every resource with an owner.".to_string()],
    )
}

pub fn row(id: &str, service: &str, month: &str, cost: f64) -> SourceRecord {
    SourceRecord::row(id, format!("{service} {month}"))
        .with_meta("month", month)
        .with_meta("service", service)
        .with_meta("cost", cost)
}

/// The three-entry idle-service dataset.
pub fn idle_dataset() -> Dataset {
    Dataset::new(vec![
        SourceRecord::row("service-a", "Service A")
            .with_meta("service", "Service A")
            .with_meta("cost", 100),
        SourceRecord::row("service-b", "Service B")
            .with_meta("service", "Service B")
            .with_meta("cost", 0),
        SourceRecord::tip("idle-tip", "decommission idle resources"),
    ])
    .unwrap()
}

pub fn billing_records(count: usize) -> Vec<SourceRecord> {
    let services = ["Compute Engine", "BigQuery", "Cloud Storage", "Cloud SQL"];
    (0..count)
        .map(|i| {
            row(
                &format!("row-{i}"),
                services[i % services.len()],
                &format!("2025-{:02}", i % 12 + 1),
                (i * 37 % 1900) as f64,
            )
        })
        .collect()
}
