mod embedding;
mod error;
mod normalization;
mod record;
mod retry;
mod tokens;

pub use embedding::{l2_normalize, HashEmbedder, HashEmbedderConfig};
pub use error::{CoreError, DataError, Result};
pub use normalization::{normalize, normalize_line, parse_cost, TextChunk, ROW_FIELD_ORDER};
pub use record::{
    dataset_hash, dataset_hash_from_pairs, prepare_chunks, ContentHash, Dataset, Origin,
    SourceRecord,
};
pub use retry::{RetryPolicy, Retryable};
pub use tokens::{estimate_tokens, estimate_tokens_with_bpe, TokenizerKind};
