use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use finops_core::{Dataset, SourceRecord};

use crate::builder::{BuildReport, CancelToken, IndexBuilder};
use crate::config::{clamp_top_k, RagConfig};
use crate::context::ContextAssembler;
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::guard::{GuardDecision, InputGuard};
use crate::index::Index;
use crate::retriever::{QueryResult, Retriever, SearchParams};
use crate::store::IndexStore;

/// Outcome of [`RagEngine::ask`]. A rejected query carries no result or context.
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub decision: GuardDecision,
    pub result: Option<QueryResult>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub loaded: bool,
    pub entries: usize,
    pub dimensions: usize,
    pub provider: Option<String>,
    pub dataset_hash: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
}

/// Owns the published index and coordinates builds and queries against it.
///
/// Queries clone the current `Arc<Index>` and keep using it for their whole
/// run; a build publishes its replacement only after the store commit.
pub struct RagEngine {
    store: IndexStore,
    builder: IndexBuilder,
    retriever: Retriever,
    guard: InputGuard,
    assembler: ContextAssembler,
    params: SearchParams,
    tips: Vec<String>,
    current: RwLock<Option<Arc<Index>>>,
    build_lock: Mutex<()>,
    load_attempted: Mutex<bool>,
}

impl RagEngine {
    pub fn new(config: &RagConfig) -> Result<Self> {
        let embedder = Embedder::from_config(config)?;
        let store = IndexStore::open(&config.store_path)?;
        let guard = InputGuard::new(&config.guard)?;
        let assembler = ContextAssembler::new(
            config.context.budget,
            config.context.unit,
            config.context.tokenizer,
        )?;
        let retriever = Retriever::new(embedder.clone()).with_cache(
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_entries,
        );
        Ok(Self::with_components(
            store,
            embedder,
            retriever,
            guard,
            assembler,
            SearchParams {
                top_k: config.retrieval.top_k,
                threshold: config.retrieval.threshold,
            },
            config.context.tips.clone(),
        ))
    }

    pub fn with_components(
        store: IndexStore,
        embedder: Embedder,
        retriever: Retriever,
        guard: InputGuard,
        assembler: ContextAssembler,
        params: SearchParams,
        tips: Vec<String>,
    ) -> Self {
        Self {
            store,
            builder: IndexBuilder::new(embedder),
            retriever,
            guard,
            assembler,
            params,
            tips,
            current: RwLock::new(None),
            build_lock: Mutex::new(()),
            load_attempted: Mutex::new(false),
        }
    }

    pub fn params(&self) -> SearchParams {
        self.params
    }

    pub fn tips(&self) -> &[String] {
        &self.tips
    }

    pub fn guard(&self) -> &InputGuard {
        &self.guard
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The published index, loading it from the store on first use.
    pub fn current_index(&self) -> Result<Option<Arc<Index>>> {
        if let Some(index) = self.current.read().as_ref() {
            return Ok(Some(Arc::clone(index)));
        }
        let mut attempted = self.load_attempted.lock();
        if let Some(index) = self.current.read().as_ref() {
            return Ok(Some(Arc::clone(index)));
        }
        if *attempted {
            return Ok(None);
        }
        let loaded = self.store.load()?.map(Arc::new);
        *attempted = true;
        if let Some(index) = &loaded {
            info!(
                entries = index.len(),
                dataset_hash = %index.dataset_hash(),
                "loaded index from store"
            );
            *self.current.write() = Some(Arc::clone(index));
        }
        Ok(loaded)
    }

    pub fn build_index(&self, dataset: &Dataset) -> Result<BuildReport> {
        self.build_index_with_cancel(dataset, &CancelToken::default())
    }

    /// Builds, persists and publishes a new index. Concurrent builds queue on
    /// an internal lock. On failure or cancellation the published index is
    /// left untouched.
    pub fn build_index_with_cancel(&self, dataset: &Dataset, cancel: &CancelToken) -> Result<BuildReport> {
        self.build_index_then(dataset, cancel, || {})
    }

    /// Like [`build_index_with_cancel`](Self::build_index_with_cancel), but runs
    /// `on_publish` while the new index is being swapped in, so callers can
    /// publish state that must change together with it. Any reader that sees
    /// the new index also sees what `on_publish` wrote. `on_publish` must not
    /// call back into the engine.
    pub fn build_index_then<F: FnOnce()>(
        &self,
        dataset: &Dataset,
        cancel: &CancelToken,
        on_publish: F,
    ) -> Result<BuildReport> {
        let _guard = self.build_lock.lock();
        let previous = match self.current_index() {
            Ok(previous) => previous,
            Err(err) => {
                warn!(error = %err, "stored index unreadable, rebuilding from scratch");
                None
            }
        };
        let (index, report) = self
            .builder
            .build_dataset(dataset, previous.as_deref(), cancel)?;
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        self.store.save(&index)?;
        {
            let mut current = self.current.write();
            *current = Some(Arc::new(index));
            on_publish();
        }
        info!(
            entries = report.entries,
            embedded = report.embedded,
            reused = report.reused,
            "published new index"
        );
        Ok(report)
    }

    pub fn ask(&self, query: &str, dataset: &Dataset) -> Result<AskResponse> {
        self.ask_with(query, dataset, self.params)
    }

    /// Guard, retrieve, assemble. A guard rejection is returned as a
    /// decision, never as a substituted answer.
    pub fn ask_with(&self, query: &str, dataset: &Dataset, params: SearchParams) -> Result<AskResponse> {
        let decision = self.guard.check(query);
        let sanitized = match &decision {
            GuardDecision::Allow(text) => text.clone(),
            GuardDecision::Reject(_) => {
                return Ok(AskResponse {
                    decision,
                    result: None,
                    context: None,
                })
            }
        };
        let result = self.search(&sanitized, dataset, params)?;
        let context = self.assembler.assemble(&result, dataset, &self.tips);
        debug!(matches = result.len(), context_len = context.len(), "assembled context");
        Ok(AskResponse {
            decision,
            result: Some(result),
            context: Some(context),
        })
    }

    /// Retrieval without the input guard, for trusted callers such as evaluation.
    pub fn search(&self, query: &str, dataset: &Dataset, params: SearchParams) -> Result<QueryResult> {
        let index = self.current_index()?.ok_or(RagError::IndexNotBuilt)?;
        let params = SearchParams {
            top_k: clamp_top_k(params.top_k),
            threshold: params.threshold,
        };
        self.retriever.retrieve(query, &index, dataset.hash(), params)
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let index = self.current_index()?;
        Ok(match index {
            Some(index) => IndexStatus {
                loaded: true,
                entries: index.len(),
                dimensions: index.dimensions(),
                provider: Some(index.provider().to_string()),
                dataset_hash: Some(index.dataset_hash().to_string()),
                built_at: Some(index.built_at()),
            },
            None => IndexStatus {
                loaded: false,
                entries: 0,
                dimensions: 0,
                provider: None,
                dataset_hash: None,
                built_at: None,
            },
        })
    }
}

/// Reads source records from a JSON array file and appends the configured tips.
pub fn load_dataset<P: AsRef<Path>, S: AsRef<str>>(path: P, tips: &[S]) -> Result<Dataset> {
    let records: Vec<SourceRecord> = Dataset::from_json_file(path)?;
    Ok(Dataset::with_tips(records, tips)?)
}
