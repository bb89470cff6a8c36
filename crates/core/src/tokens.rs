use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    Cl100k,
    O200k,
    Gpt2,
}

impl TokenizerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "cl100k" | "cl100k_base" => Some(TokenizerKind::Cl100k),
            "o200k" | "o200k_base" => Some(TokenizerKind::O200k),
            "gpt2" | "p50k" | "p50k_base" => Some(TokenizerKind::Gpt2),
            _ => None,
        }
    }

    pub fn build(&self) -> Result<tiktoken_rs::CoreBPE> {
        let built = match self {
            TokenizerKind::Cl100k => tiktoken_rs::cl100k_base(),
            TokenizerKind::O200k => tiktoken_rs::o200k_base(),
            TokenizerKind::Gpt2 => tiktoken_rs::p50k_base(),
        };
        built.map_err(|e| CoreError::Tokenizer(e.to_string()))
    }
}

pub fn estimate_tokens(text: &str, tokenizer: &TokenizerKind) -> Result<usize> {
    let encoder = tokenizer.build()?;
    Ok(estimate_tokens_with_bpe(text, &encoder))
}

pub fn estimate_tokens_with_bpe(text: &str, tokenizer: &tiktoken_rs::CoreBPE) -> usize {
    tokenizer.encode_with_special_tokens(text).len()
}
