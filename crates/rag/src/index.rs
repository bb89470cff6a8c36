use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finops_core::{dataset_hash_from_pairs, ContentHash};

use crate::error::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record_id: String,
    pub vector: Vec<f32>,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub dataset_hash: String,
    pub built_at: DateTime<Utc>,
    pub dimensions: usize,
    pub entry_count: usize,
    /// Embedding provider the vectors came from; vectors are only reused
    /// across builds with the same provider.
    pub provider: String,
}

/// An immutable, fully built index. Rebuilds produce a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    header: IndexHeader,
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(provider: impl Into<String>, entries: Vec<IndexEntry>) -> Result<Self> {
        Self::assemble(provider.into(), entries, Utc::now())
    }

    fn assemble(provider: String, entries: Vec<IndexEntry>, built_at: DateTime<Utc>) -> Result<Self> {
        let dimensions = entries.first().map(|e| e.vector.len()).unwrap_or(0);
        check_dimensions(&entries, dimensions)?;
        let header = IndexHeader {
            dataset_hash: hash_entries(&entries),
            built_at,
            dimensions,
            entry_count: entries.len(),
            provider,
        };
        Ok(Self { header, entries })
    }

    /// Reassembles a persisted index, refusing headers that disagree with their entries.
    pub fn from_parts(header: IndexHeader, entries: Vec<IndexEntry>) -> Result<Self> {
        if header.entry_count != entries.len() {
            return Err(RagError::Persistence(format!(
                "header lists {} entries but {} were stored",
                header.entry_count,
                entries.len()
            )));
        }
        check_dimensions(&entries, header.dimensions)
            .map_err(|e| RagError::Persistence(e.to_string()))?;
        if hash_entries(&entries) != header.dataset_hash {
            return Err(RagError::Persistence(
                "stored entries do not match the recorded dataset hash".into(),
            ));
        }
        Ok(Self { header, entries })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn dataset_hash(&self) -> &str {
        &self.header.dataset_hash
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.header.built_at
    }

    pub fn dimensions(&self) -> usize {
        self.header.dimensions
    }

    pub fn provider(&self) -> &str {
        &self.header.provider
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_stale(&self, current_dataset_hash: &str) -> bool {
        self.header.dataset_hash != current_dataset_hash
    }

    pub(crate) fn vectors_by_hash(&self) -> HashMap<&ContentHash, &[f32]> {
        self.entries
            .iter()
            .map(|entry| (&entry.content_hash, entry.vector.as_slice()))
            .collect()
    }
}

/// Free-standing staleness check, for callers holding only a hash.
pub fn is_stale(index: &Index, current_dataset_hash: &str) -> bool {
    index.is_stale(current_dataset_hash)
}

fn hash_entries(entries: &[IndexEntry]) -> String {
    dataset_hash_from_pairs(
        entries
            .iter()
            .map(|entry| (entry.record_id.as_str(), &entry.content_hash)),
    )
}

fn check_dimensions(entries: &[IndexEntry], expected: usize) -> Result<()> {
    if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
        return Err(RagError::DimensionMismatch {
            expected,
            actual: bad.vector.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use finops_core::{Dataset, SourceRecord};

    fn entry(id: &str, text: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            record_id: id.to_string(),
            vector,
            content_hash: ContentHash::of(text),
        }
    }

    #[test]
    fn dataset_hash_matches_source_dataset() {
        let dataset = Dataset::new(vec![
            SourceRecord::tip("a", "Tag every resource"),
            SourceRecord::tip("b", "Rightsize compute"),
        ])
        .unwrap();
        let entries = dataset
            .chunks()
            .iter()
            .map(|chunk| IndexEntry {
                record_id: chunk.record_id.clone(),
                vector: vec![1.0, 0.0],
                content_hash: chunk.hash.clone(),
            })
            .collect();
        let index = Index::new("hash", entries).unwrap();
        assert!(!index.is_stale(dataset.hash()));
        assert!(is_stale(&index, "something-else"));
        assert_eq!(index.dimensions(), 2);
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let err = Index::new(
            "hash",
            vec![entry("a", "x", vec![1.0, 0.0]), entry("b", "y", vec![1.0])],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn tampered_parts_are_rejected() {
        let index = Index::new("hash", vec![entry("a", "x", vec![0.5, 0.5])]).unwrap();
        let mut header = index.header().clone();
        header.dataset_hash = "0".repeat(64);
        let err = Index::from_parts(header, index.entries().to_vec()).unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));
    }
}
