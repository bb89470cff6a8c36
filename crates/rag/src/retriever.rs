use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::TtlCache;
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::Index;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record_id: String,
    pub score: f32,
}

/// Matches ordered by descending score, at most `top_k`, none below the threshold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub matches: Vec<ScoredRecord>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &str> {
        self.matches.iter().map(|m| m.record_id.as_str())
    }
}

/// `dot(a, b) / (|a| * |b|)`, with zero-length or zero-norm vectors scoring 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() {
        score.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Refuses indexes that cannot answer queries about the current dataset.
pub fn ensure_searchable(index: &Index, current_dataset_hash: &str) -> Result<()> {
    if index.is_stale(current_dataset_hash) {
        return Err(RagError::StaleIndex {
            index_hash: index.dataset_hash().to_string(),
            current_hash: current_dataset_hash.to_string(),
        });
    }
    if index.is_empty() {
        return Err(RagError::EmptyIndex);
    }
    Ok(())
}

/// Exact linear scan. Ties keep index order.
pub fn rank(query: &[f32], index: &Index, params: SearchParams) -> Result<QueryResult> {
    if query.len() != index.dimensions() {
        return Err(RagError::DimensionMismatch {
            expected: index.dimensions(),
            actual: query.len(),
        });
    }
    let mut scored: Vec<(usize, f32)> = index
        .entries()
        .iter()
        .enumerate()
        .map(|(position, entry)| (position, cosine_similarity(query, &entry.vector)))
        .collect();
    // sort_by is stable, so equal scores stay in insertion order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(params.top_k);
    let matches = scored
        .into_iter()
        .filter(|(_, score)| *score >= params.threshold)
        .map(|(position, score)| ScoredRecord {
            record_id: index.entries()[position].record_id.clone(),
            score,
        })
        .collect();
    Ok(QueryResult { matches })
}

pub struct Retriever {
    embedder: Embedder,
    cache: Option<TtlCache<String, Arc<Vec<f32>>>>,
}

impl Retriever {
    pub fn new(embedder: Embedder) -> Self {
        Self {
            embedder,
            cache: None,
        }
    }

    /// Caches query embeddings for `ttl`, keyed by the sanitized query text.
    pub fn with_cache(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.cache = Some(TtlCache::new(ttl, max_entries));
        self
    }

    /// Ranks `index` against `query`. Fails on a stale or empty index before
    /// any embedding call is made.
    pub fn retrieve(
        &self,
        query: &str,
        index: &Index,
        current_dataset_hash: &str,
        params: SearchParams,
    ) -> Result<QueryResult> {
        ensure_searchable(index, current_dataset_hash)?;
        let vector = self.query_vector(query)?;
        let result = rank(&vector, index, params)?;
        debug!(
            matches = result.len(),
            top_k = params.top_k,
            threshold = params.threshold,
            "retrieved"
        );
        Ok(result)
    }

    fn query_vector(&self, query: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(cache) = &self.cache {
            if let Some(vector) = cache.get(&query.to_string()) {
                debug!("query embedding cache hit");
                return Ok(vector);
            }
        }
        let vector = Arc::new(self.embedder.embed_one(query)?);
        if let Some(cache) = &self.cache {
            cache.insert(query.to_string(), Arc::clone(&vector));
        }
        Ok(vector)
    }
}
