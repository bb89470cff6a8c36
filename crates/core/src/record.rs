use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, DataError, Result};
use crate::normalization::{normalize, TextChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Row,
    Tip,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Row => "row",
            Origin::Tip => "tip",
        }
    }
}

/// One normalized cost row or static tip, as handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub text: String,
    pub origin: Origin,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SourceRecord {
    pub fn row(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            origin: Origin::Row,
            metadata: BTreeMap::new(),
        }
    }

    pub fn tip(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            origin: Origin::Tip,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata value rendered as plain text; `None` for missing, null or blank values.
    pub fn meta_text(&self, key: &str) -> Option<String> {
        self.metadata.get(key).and_then(render_value)
    }
}

pub(crate) fn render_value(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) => format_number(f),
            None => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// BLAKE3 digest of a text chunk, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(text: &str) -> Self {
        Self(blake3::hash(text.as_bytes()).to_hex().to_string())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes every record, rejecting malformed records and duplicate identifiers.
pub fn prepare_chunks(records: &[SourceRecord]) -> std::result::Result<Vec<TextChunk>, DataError> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut chunks = Vec::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(DataError::DuplicateId(record.id.clone()));
        }
        chunks.push(normalize(record)?);
    }
    Ok(chunks)
}

pub fn dataset_hash(chunks: &[TextChunk]) -> String {
    dataset_hash_from_pairs(
        chunks
            .iter()
            .map(|chunk| (chunk.record_id.as_str(), &chunk.hash)),
    )
}

/// Order-sensitive digest over `(id, content hash)` pairs.
pub fn dataset_hash_from_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a ContentHash)>,
{
    let mut hasher = blake3::Hasher::new();
    for (id, hash) in pairs {
        hasher.update(id.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(hash.as_str().as_bytes());
        hasher.update(&[0x1e]);
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// Validated snapshot of the source data with its chunks and dataset hash.
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<SourceRecord>,
    chunks: Vec<TextChunk>,
    positions: HashMap<String, usize>,
    hash: String,
}

impl Dataset {
    pub fn new(records: Vec<SourceRecord>) -> std::result::Result<Self, DataError> {
        let chunks = prepare_chunks(&records)?;
        let positions = records
            .iter()
            .enumerate()
            .map(|(idx, record)| (record.id.clone(), idx))
            .collect();
        let hash = dataset_hash(&chunks);
        Ok(Self {
            records,
            chunks,
            positions,
            hash,
        })
    }

    /// Appends static tips as `tip` records with ids `tip-1`, `tip-2`, ...
    pub fn with_tips<S: AsRef<str>>(
        mut records: Vec<SourceRecord>,
        tips: &[S],
    ) -> std::result::Result<Self, DataError> {
        for (idx, tip) in tips.iter().enumerate() {
            records.push(SourceRecord::tip(format!("tip-{}", idx + 1), tip.as_ref()));
        }
        Self::new(records)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRecord>> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| CoreError::Records {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| CoreError::Records {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn chunks(&self) -> &[TextChunk] {
        &self.chunks
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn get(&self, id: &str) -> Option<&SourceRecord> {
        self.positions.get(id).map(|idx| &self.records[*idx])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
