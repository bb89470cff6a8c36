//! Recall@k over a small question set.
//!
//! A case counts as found at `k` when any expected term occurs,
//! case-insensitively, in the text or metadata of one of the first `k`
//! retrieved records.

use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use finops_core::SourceRecord;

use crate::context::RecordLookup;
use crate::error::{RagError, Result};
use crate::retriever::{QueryResult, ScoredRecord, SearchParams};

pub const DEFAULT_KS: [usize; 3] = [1, 3, 5];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    pub id: Value,
    #[serde(alias = "q")]
    pub question: String,
    pub expected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallAtK {
    pub k: usize,
    pub recall: f64,
    pub n_queries: usize,
    pub n_found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub id: Value,
    pub question: String,
    pub expected: Vec<String>,
    /// 1-based rank of the first retrieved record containing an expected term.
    pub first_hit_rank: Option<usize>,
    pub matched_terms: Vec<String>,
    pub retrieved: Vec<ScoredRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub per_k: Vec<RecallAtK>,
    pub cases: Vec<CaseOutcome>,
}

pub fn load_cases<P: AsRef<Path>>(path: P) -> Result<Vec<EvalCase>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| RagError::Source(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| RagError::Source(format!("invalid eval cases in {}: {e}", path.display())))
}

/// Runs every case once at the largest `k`; smaller cut-offs reuse the prefix.
pub fn evaluate<L, F>(
    cases: &[EvalCase],
    ks: &[usize],
    threshold: f32,
    records: &L,
    search: F,
) -> Result<EvalReport>
where
    L: RecordLookup + Sync + ?Sized,
    F: Fn(&str, SearchParams) -> Result<QueryResult> + Sync,
{
    let max_k = ks.iter().copied().max().unwrap_or(1).max(1);
    let params = SearchParams {
        top_k: max_k,
        threshold,
    };
    let outcomes = cases
        .par_iter()
        .map(|case| {
            let result = search(&case.question, params)?;
            Ok(score_case(case, result, records))
        })
        .collect::<Result<Vec<_>>>()?;

    let per_k = ks
        .iter()
        .map(|&k| {
            let n_found = outcomes
                .iter()
                .filter(|o| o.first_hit_rank.is_some_and(|rank| rank <= k))
                .count();
            let recall = if outcomes.is_empty() {
                0.0
            } else {
                n_found as f64 / outcomes.len() as f64
            };
            info!(k, n_found, n_queries = outcomes.len(), recall, "recall@k");
            RecallAtK {
                k,
                recall,
                n_queries: outcomes.len(),
                n_found,
            }
        })
        .collect();
    Ok(EvalReport {
        per_k,
        cases: outcomes,
    })
}

fn score_case<L: RecordLookup + ?Sized>(case: &EvalCase, result: QueryResult, records: &L) -> CaseOutcome {
    let mut first_hit_rank = None;
    let mut matched_terms = Vec::new();
    for (position, scored) in result.matches.iter().enumerate() {
        let Some(record) = records.lookup(&scored.record_id) else {
            continue;
        };
        for term in &case.expected {
            if term_in_record(term, record) {
                first_hit_rank.get_or_insert(position + 1);
                if !matched_terms.contains(term) {
                    matched_terms.push(term.clone());
                }
            }
        }
    }
    CaseOutcome {
        id: case.id.clone(),
        question: case.question.clone(),
        expected: case.expected.clone(),
        first_hit_rank,
        matched_terms,
        retrieved: result.matches,
    }
}

pub fn term_in_record(term: &str, record: &SourceRecord) -> bool {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return false;
    }
    record.text.to_lowercase().contains(&term)
        || record
            .metadata
            .keys()
            .filter_map(|key| record.meta_text(key))
            .any(|value| value.to_lowercase().contains(&term))
}
