use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use finops_core::{RetryPolicy, TokenizerKind};

use crate::context::BudgetUnit;
use crate::error::{RagError, Result};
use crate::guard::GuardRules;

pub const DEFAULT_CONFIG: &str = "finops.toml";
pub const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "hash")]
    Hash,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "hash" => Some(ProviderKind::Hash),
            "openai" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub base_url: String,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub hash_dimensions: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hash,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            batch_size: 64,
            max_concurrent_batches: 2,
            hash_dimensions: 256,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub budget: usize,
    pub unit: BudgetUnit,
    pub tokenizer: TokenizerKind,
    pub tips: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: 2000,
            unit: BudgetUnit::Chars,
            tokenizer: TokenizerKind::Cl100k,
            tips: default_tips(),
        }
    }
}

fn default_tips() -> Vec<String> {
    [
        "Decommission idle resources: services with zero or near-zero cost over recent months are candidates for removal.",
        "Investigate month-over-month spend increases above 20%: check recent deployments, pricing tier changes, or noisy batch jobs.",
        "Tag every resource with an owner and cost center so spend can be attributed.",
        "Rightsize over-provisioned compute and move steady workloads to committed-use pricing.",
        "Apply storage lifecycle policies to move cold data to cheaper tiers.",
    ]
    .iter()
    .map(|tip| tip.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub store_path: PathBuf,
    pub records_path: PathBuf,
    pub embedding: EmbeddingConfig,
    pub retry: RetryPolicy,
    pub retrieval: RetrievalConfig,
    pub guard: GuardRules,
    pub context: ContextConfig,
    pub cache: CacheConfig,
    pub generation: GenerationConfig,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub openai_api_key: Option<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/finops_index.sqlite"),
            records_path: PathBuf::from("data/records.json"),
            embedding: EmbeddingConfig::default(),
            retry: RetryPolicy::default(),
            retrieval: RetrievalConfig::default(),
            guard: GuardRules::default(),
            context: ContextConfig::default(),
            cache: CacheConfig::default(),
            generation: GenerationConfig::default(),
            openai_api_key: None,
        }
    }
}

impl RagConfig {
    /// Reads the TOML file (explicit path, then `FINOPS_CONFIG`, then `finops.toml`),
    /// applies environment overrides and validates the result. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("FINOPS_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| {
                RagError::Config(format!("failed to read config {}: {e}", path.display()))
            })?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| RagError::Config(format!("invalid config: {e}")))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = ProviderKind::from_str(&value)
                .ok_or_else(|| RagError::Config(format!("unknown embedding provider {value}")))?;
        }
        if let Some(value) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = lookup("OPENAI_BASE_URL") {
            self.embedding.base_url = value;
        }
        if let Some(value) = lookup("OPENAI_API_KEY") {
            if !value.trim().is_empty() {
                self.openai_api_key = Some(value.trim().to_string());
            }
        }
        if let Some(value) = lookup("FINOPS_INDEX_DB") {
            self.store_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("FINOPS_RECORDS") {
            self.records_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("FINOPS_TOP_K") {
            self.retrieval.top_k = value
                .parse()
                .map_err(|_| RagError::Config(format!("FINOPS_TOP_K is not a number: {value}")))?;
        }
        if let Some(value) = lookup("FINOPS_THRESHOLD") {
            self.retrieval.threshold = value.parse().map_err(|_| {
                RagError::Config(format!("FINOPS_THRESHOLD is not a number: {value}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.retrieval.top_k = clamp_top_k(self.retrieval.top_k);
        if !(-1.0..=1.0).contains(&self.retrieval.threshold) {
            return Err(RagError::Config(format!(
                "similarity threshold must lie in [-1, 1], got {}",
                self.retrieval.threshold
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Config("embedding.batch_size must be positive".into()));
        }
        if self.embedding.provider == ProviderKind::Hash && self.embedding.hash_dimensions == 0 {
            return Err(RagError::Config("embedding.hash_dimensions must be positive".into()));
        }
        if self.context.budget == 0 {
            return Err(RagError::Config("context.budget must be positive".into()));
        }
        Ok(())
    }
}

pub fn clamp_top_k(top_k: usize) -> usize {
    top_k.clamp(1, MAX_TOP_K)
}
