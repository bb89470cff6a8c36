use std::path::PathBuf;

use thiserror::Error;

/// A source record that cannot be turned into a text chunk. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("record has an empty identifier")]
    MissingId,
    #[error("record {0} has no display text")]
    EmptyText(String),
    #[error("row {id} is missing required field '{field}'")]
    MissingField { id: String, field: &'static str },
    #[error("row {id} has a non-numeric cost: {value}")]
    InvalidCost { id: String, value: String },
    #[error("duplicate record identifier: {0}")]
    DuplicateId(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("failed to read records from {path:?}: {message}")]
    Records { path: PathBuf, message: String },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
