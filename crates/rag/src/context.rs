use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use finops_core::{estimate_tokens_with_bpe, normalize_line, Dataset, Origin, SourceRecord, TokenizerKind};

use crate::error::Result;
use crate::retriever::QueryResult;

const ROWS_HEADER: &str = "Context (rows):";
const TIPS_HEADER: &str = "Tips:";
const NO_ROWS: &str = "No additional numeric context provided.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    #[default]
    Chars,
    Tokens,
}

/// Identifier to record lookup used when rendering retrieved matches.
pub trait RecordLookup {
    fn lookup(&self, id: &str) -> Option<&SourceRecord>;
}

impl RecordLookup for Dataset {
    fn lookup(&self, id: &str) -> Option<&SourceRecord> {
        self.get(id)
    }
}

impl RecordLookup for HashMap<String, SourceRecord> {
    fn lookup(&self, id: &str) -> Option<&SourceRecord> {
        self.get(id)
    }
}

enum Measure {
    Chars,
    Tokens(tiktoken_rs::CoreBPE),
}

/// Renders retrieved records and static tips into one bounded block.
pub struct ContextAssembler {
    budget: usize,
    measure: Measure,
}

impl ContextAssembler {
    pub fn new(budget: usize, unit: BudgetUnit, tokenizer: TokenizerKind) -> Result<Self> {
        let measure = match unit {
            BudgetUnit::Chars => Measure::Chars,
            BudgetUnit::Tokens => Measure::Tokens(tokenizer.build()?),
        };
        Ok(Self { budget, measure })
    }

    pub fn chars(budget: usize) -> Self {
        Self {
            budget,
            measure: Measure::Chars,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    fn size(&self, text: &str) -> usize {
        match &self.measure {
            Measure::Chars => text.chars().count(),
            Measure::Tokens(bpe) => estimate_tokens_with_bpe(text, bpe),
        }
    }

    /// Rows appear in rank order, followed by the tips. While the block is
    /// over budget the last item is dropped, so tips go before any row and
    /// rows go lowest-ranked first. Returns an empty string when not even the
    /// headers fit.
    pub fn assemble<L, S>(&self, results: &QueryResult, records: &L, tips: &[S]) -> String
    where
        L: RecordLookup + ?Sized,
        S: AsRef<str>,
    {
        let mut rows = Vec::with_capacity(results.len());
        let mut seen_tips = HashSet::new();
        for (position, scored) in results.matches.iter().enumerate() {
            let Some(record) = records.lookup(&scored.record_id) else {
                warn!(record_id = %scored.record_id, "retrieved record missing from dataset, skipped");
                continue;
            };
            if record.origin == Origin::Tip {
                seen_tips.insert(normalize_line(&record.text));
            }
            rows.push(render_record(position + 1, record, scored.score));
        }
        let mut tip_lines: Vec<String> = tips
            .iter()
            .map(|tip| normalize_line(tip.as_ref()))
            .filter(|tip| !tip.is_empty() && !seen_tips.contains(tip))
            .collect();

        loop {
            let block = render_block(&rows, &tip_lines);
            if self.size(&block) <= self.budget {
                return block;
            }
            if tip_lines.pop().is_none() && rows.pop().is_none() {
                return String::new();
            }
        }
    }
}

fn render_record(rank: usize, record: &SourceRecord, score: f32) -> String {
    let text = normalize_line(&record.text);
    match record.origin {
        Origin::Tip => format!("[{rank}] tip: {text} (score {score:.3})"),
        Origin::Row => {
            let month = record.meta_text("month");
            let service = record.meta_text("service");
            let cost = record.meta_text("cost");
            let summary = match (month, service, cost) {
                (Some(month), Some(service), Some(cost)) => {
                    format!("{month}: {service} -> ${cost}")
                }
                (None, Some(service), Some(cost)) => format!("{service} -> ${cost}"),
                _ => return format!("[{rank}] {text} (score {score:.3})"),
            };
            format!("[{rank}] {summary} | {text} (score {score:.3})")
        }
    }
}

fn render_block(rows: &[String], tips: &[String]) -> String {
    let mut out = String::new();
    out.push_str(ROWS_HEADER);
    out.push('\n');
    if rows.is_empty() {
        out.push_str(NO_ROWS);
        out.push('\n');
    }
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    if !tips.is_empty() {
        out.push('\n');
        out.push_str(TIPS_HEADER);
        out.push('\n');
        for tip in tips {
            out.push_str("- ");
            out.push_str(tip);
            out.push('\n');
        }
    }
    out.truncate(out.trim_end().len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::ScoredRecord;

    fn dataset() -> Dataset {
        Dataset::new(vec![
            SourceRecord::row("r1", "BigQuery usage")
                .with_meta("month", "2025-03")
                .with_meta("service", "BigQuery")
                .with_meta("cost", 420.0),
            SourceRecord::row("r2", "Cloud Storage usage")
                .with_meta("month", "2025-03")
                .with_meta("service", "Cloud Storage")
                .with_meta("cost", 0),
            SourceRecord::tip("tip-1", "Decommission idle resources."),
        ])
        .unwrap()
    }

    fn result(ids: &[(&str, f32)]) -> QueryResult {
        QueryResult {
            matches: ids
                .iter()
                .map(|(id, score)| ScoredRecord {
                    record_id: id.to_string(),
                    score: *score,
                })
                .collect(),
        }
    }

    #[test]
    fn renders_rows_then_tips() {
        let block = ContextAssembler::chars(2000).assemble(
            &result(&[("r2", 0.91), ("r1", 0.4)]),
            &dataset(),
            &["Tag every resource."],
        );
        assert_eq!(
            block,
            "Context (rows):\n\
             [1] 2025-03: Cloud Storage -> $0 | Cloud Storage usage (score 0.910)\n\
             [2] 2025-03: BigQuery -> $420 | BigQuery usage (score 0.400)\n\
             \n\
             Tips:\n\
             - Tag every resource."
        );
    }

    #[test]
    fn over_budget_drops_tips_then_lowest_rows() {
        let assembler = ContextAssembler::chars(2000);
        let data = dataset();
        let matches = result(&[("r2", 0.91), ("r1", 0.4)]);
        let full = assembler.assemble(&matches, &data, &["Tag every resource."]);
        let without_tip = assembler.assemble(&matches, &data, &[] as &[&str]);
        let top_only = assembler.assemble(&result(&[("r2", 0.91)]), &data, &[] as &[&str]);

        let tight = ContextAssembler::chars(without_tip.chars().count());
        assert_eq!(tight.assemble(&matches, &data, &["Tag every resource."]), without_tip);
        let tighter = ContextAssembler::chars(top_only.chars().count());
        assert_eq!(tighter.assemble(&matches, &data, &["Tag every resource."]), top_only);
        assert!(full.len() > without_tip.len());
        assert_eq!(ContextAssembler::chars(5).assemble(&matches, &data, &["x"]), "");
    }

    #[test]
    fn retrieved_tips_are_not_repeated() {
        let block = ContextAssembler::chars(2000).assemble(
            &result(&[("tip-1", 0.8)]),
            &dataset(),
            &["Decommission idle resources.", "Tag every resource."],
        );
        assert_eq!(block.matches("Decommission idle resources.").count(), 1);
        assert!(block.contains("- Tag every resource."));
    }

    #[test]
    fn missing_records_are_skipped() {
        let block = ContextAssembler::chars(2000).assemble(
            &result(&[("gone", 0.9)]),
            &dataset(),
            &[] as &[&str],
        );
        assert_eq!(block, "Context (rows):\nNo additional numeric context provided.");
    }

    #[test]
    fn token_budget_is_respected() {
        let assembler = ContextAssembler::new(40, BudgetUnit::Tokens, TokenizerKind::Cl100k).unwrap();
        let block = assembler.assemble(
            &result(&[("r2", 0.91), ("r1", 0.4)]),
            &dataset(),
            &["Tag every resource."],
        );
        let bpe = TokenizerKind::Cl100k.build().unwrap();
        assert!(estimate_tokens_with_bpe(&block, &bpe) <= 40);
        assert!(block.starts_with("Context (rows):\n[1]"));
    }
}
