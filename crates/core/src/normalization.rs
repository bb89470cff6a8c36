use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::DataError;
use crate::record::{format_number, render_value, ContentHash, Origin, SourceRecord};

/// Row fields rendered first, in this order. Remaining metadata keys follow sorted.
pub const ROW_FIELD_ORDER: [&str; 8] = [
    "month",
    "service",
    "cost",
    "resource_id",
    "region",
    "account_id",
    "subscription",
    "tags",
];

const FIELD_SEPARATOR: &str = " | ";

/// Canonical text derived from a record. This is what gets embedded and hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub record_id: String,
    pub text: String,
    pub hash: ContentHash,
}

pub fn normalize(record: &SourceRecord) -> Result<TextChunk, DataError> {
    if record.id.trim().is_empty() {
        return Err(DataError::MissingId);
    }
    let display = normalize_line(&record.text);
    if display.is_empty() {
        return Err(DataError::EmptyText(record.id.clone()));
    }
    let mut parts = Vec::with_capacity(record.metadata.len() + 1);
    match record.origin {
        Origin::Tip => parts.push(format!("tip: {display}")),
        Origin::Row => {
            validate_row(record)?;
            parts.push(display);
            for field in ROW_FIELD_ORDER {
                if let Some(value) = field_text(record, field) {
                    parts.push(format!("{field}:{value}"));
                }
            }
        }
    }
    // BTreeMap iteration is already key-sorted.
    for (key, value) in &record.metadata {
        if record.origin == Origin::Row && ROW_FIELD_ORDER.contains(&key.as_str()) {
            continue;
        }
        if let Some(value) = render_value(value) {
            parts.push(format!("{key}:{value}"));
        }
    }
    let text = normalize_line(&parts.join(FIELD_SEPARATOR));
    let hash = ContentHash::of(&text);
    Ok(TextChunk {
        record_id: record.id.clone(),
        text,
        hash,
    })
}

fn validate_row(record: &SourceRecord) -> Result<(), DataError> {
    if record.meta_text("service").is_none() {
        return Err(DataError::MissingField {
            id: record.id.clone(),
            field: "service",
        });
    }
    let cost = record
        .meta_text("cost")
        .ok_or_else(|| DataError::MissingField {
            id: record.id.clone(),
            field: "cost",
        })?;
    if parse_cost(&cost).is_none() {
        return Err(DataError::InvalidCost {
            id: record.id.clone(),
            value: cost,
        });
    }
    Ok(())
}

fn field_text(record: &SourceRecord, field: &str) -> Option<String> {
    let raw = record.meta_text(field)?;
    if field == "cost" {
        return parse_cost(&raw).map(format_number);
    }
    Some(raw)
}

/// Parses `1200`, `1,200.50` or `$99` as a cost.
pub fn parse_cost(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn normalize_line(line: &str) -> String {
    let trimmed = line.trim_matches(|c: char| c.is_control() || c.is_whitespace());
    let nfkc = trimmed.nfkc().collect::<String>();
    let mut result = String::with_capacity(nfkc.len());
    let mut prev_space = false;
    for ch in nfkc.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
        } else if ch.is_control() {
            continue;
        } else {
            result.push(ch);
            prev_space = false;
        }
    }
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_whitespace() {
        let line = "  Compute\tEngine \n  spend  ";
        assert_eq!(normalize_line(line), "Compute Engine spend");
    }

    #[test]
    fn row_fields_follow_fixed_order() {
        let record = SourceRecord::row("r-7", "BigQuery  in January")
            .with_meta("tags", "team=data")
            .with_meta("cost", 500)
            .with_meta("zone", "a")
            .with_meta("service", "BigQuery")
            .with_meta("month", "2025-01");
        let chunk = normalize(&record).unwrap();
        assert_eq!(
            chunk.text,
            "BigQuery in January | month:2025-01 | service:BigQuery | cost:500 | tags:team=data | zone:a"
        );
        assert_eq!(chunk.record_id, "r-7");
        assert!(!chunk.text.contains("r-7"));
    }

    #[test]
    fn tips_are_prefixed() {
        let chunk = normalize(&SourceRecord::tip("tip-1", "Decommission idle resources")).unwrap();
        assert_eq!(chunk.text, "tip: Decommission idle resources");
    }

    #[test]
    fn cost_strings_are_canonicalized() {
        let a = SourceRecord::row("a", "x")
            .with_meta("service", "S")
            .with_meta("cost", "1,200");
        let b = SourceRecord::row("a", "x")
            .with_meta("service", "S")
            .with_meta("cost", 1200);
        assert_eq!(normalize(&a).unwrap().hash, normalize(&b).unwrap().hash);
    }

    #[test]
    fn malformed_rows_are_data_errors() {
        let missing_cost = SourceRecord::row("a", "x").with_meta("service", "S");
        assert_eq!(
            normalize(&missing_cost).unwrap_err(),
            DataError::MissingField {
                id: "a".to_string(),
                field: "cost"
            }
        );
        let bad_cost = SourceRecord::row("b", "x")
            .with_meta("service", "S")
            .with_meta("cost", "lots");
        assert!(matches!(
            normalize(&bad_cost),
            Err(DataError::InvalidCost { .. })
        ));
        let blank = SourceRecord::tip("c", "   ");
        assert_eq!(
            normalize(&blank).unwrap_err(),
            DataError::EmptyText("c".to_string())
        );
        assert_eq!(
            normalize(&SourceRecord::tip(" ", "text")).unwrap_err(),
            DataError::MissingId
        );
    }
}
