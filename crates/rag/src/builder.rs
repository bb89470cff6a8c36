use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use finops_core::{ContentHash, Dataset, SourceRecord};

use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::{Index, IndexEntry};

/// Cooperative cancellation flag shared between a build and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub entries: usize,
    /// Texts sent to the embedding provider.
    pub embedded: usize,
    /// Entries whose vector was carried over from the previous index.
    pub reused: usize,
    pub dataset_hash: String,
}

pub struct IndexBuilder {
    embedder: Embedder,
}

impl IndexBuilder {
    pub fn new(embedder: Embedder) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn build(&self, records: &[SourceRecord], existing: Option<&Index>) -> Result<Index> {
        self.build_with_cancel(records, existing, &CancelToken::default())
    }

    pub fn build_with_cancel(
        &self,
        records: &[SourceRecord],
        existing: Option<&Index>,
        cancel: &CancelToken,
    ) -> Result<Index> {
        let dataset = Dataset::new(records.to_vec())?;
        let (index, _) = self.build_dataset(&dataset, existing, cancel)?;
        Ok(index)
    }

    /// Builds a fresh index for `dataset`. Entries whose content hash already
    /// has a vector in `existing` are carried over; the rest are embedded.
    /// Nothing observable changes if the build fails or is cancelled.
    pub fn build_dataset(
        &self,
        dataset: &Dataset,
        existing: Option<&Index>,
        cancel: &CancelToken,
    ) -> Result<(Index, BuildReport)> {
        let provider = self.embedder.provider_name().to_string();
        let reusable: HashMap<&ContentHash, &[f32]> = match existing {
            Some(index) if self.can_reuse(index, &provider) => index.vectors_by_hash(),
            Some(index) if !index.is_empty() => {
                info!(
                    previous = index.provider(),
                    previous_dimensions = index.dimensions(),
                    current = %provider,
                    "embedding configuration changed, re-embedding every record"
                );
                HashMap::new()
            }
            _ => HashMap::new(),
        };

        // Identical texts share one embedding request.
        let mut pending: Vec<String> = Vec::new();
        let mut pending_slot: HashMap<&ContentHash, usize> = HashMap::new();
        let mut reused = 0usize;
        for chunk in dataset.chunks() {
            if reusable.contains_key(&chunk.hash) {
                reused += 1;
            } else if !pending_slot.contains_key(&chunk.hash) {
                pending_slot.insert(&chunk.hash, pending.len());
                pending.push(chunk.text.clone());
            }
        }
        debug!(
            records = dataset.len(),
            reused,
            to_embed = pending.len(),
            "planned index build"
        );

        let fresh = if pending.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_with_cancel(&pending, cancel)?
        };
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        if let (Some(index), Some(vector)) = (existing, fresh.first()) {
            if !reusable.is_empty() && vector.len() != index.dimensions() {
                info!(
                    previous_dimensions = index.dimensions(),
                    current_dimensions = vector.len(),
                    "provider changed vector size, re-embedding every record"
                );
                return self.build_dataset(dataset, None, cancel);
            }
        }

        let mut entries = Vec::with_capacity(dataset.len());
        for chunk in dataset.chunks() {
            let vector = match reusable.get(&chunk.hash) {
                Some(vector) => vector.to_vec(),
                None => {
                    let slot = pending_slot[&chunk.hash];
                    fresh[slot].clone()
                }
            };
            entries.push(IndexEntry {
                record_id: chunk.record_id.clone(),
                vector,
                content_hash: chunk.hash.clone(),
            });
        }

        let index = Index::new(provider, entries)?;
        let report = BuildReport {
            entries: index.len(),
            embedded: fresh.len(),
            reused,
            dataset_hash: index.dataset_hash().to_string(),
        };
        info!(
            entries = report.entries,
            embedded = report.embedded,
            reused = report.reused,
            dataset_hash = %report.dataset_hash,
            "index built"
        );
        Ok((index, report))
    }

    fn can_reuse(&self, index: &Index, provider: &str) -> bool {
        index.provider() == provider
            && self
                .embedder
                .dimensions()
                .map_or(true, |dims| dims == index.dimensions())
    }
}
