//! Screening of untrusted query text before it is embedded or forwarded to a
//! generative model.
//!
//! Rules are configuration data: each category holds a list of
//! case-insensitive regular expressions, matched against the NFKC-normalized,
//! whitespace-collapsed query. A rejection is final and carries the reason the
//! caller must show to the end user.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use finops_core::normalize_line;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Empty,
    ControlChars,
    Url,
    Injection,
    Dangerous,
}

impl RuleCategory {
    fn reason(&self) -> &'static str {
        match self {
            RuleCategory::Empty => "Question must be provided.",
            RuleCategory::ControlChars => "Query contains control characters.",
            RuleCategory::Url => "Query contains a URL; links are not accepted.",
            RuleCategory::Injection => {
                "Query contains instructions that try to override the assistant."
            }
            RuleCategory::Dangerous => "Query contains disallowed content.",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{reason}")]
pub struct GuardRejection {
    pub category: RuleCategory,
    pub reason: String,
}

impl GuardRejection {
    fn new(category: RuleCategory) -> Self {
        Self {
            category,
            reason: category.reason().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    Allow(String),
    Reject(GuardRejection),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allow(_))
    }

    pub fn into_result(self) -> std::result::Result<String, GuardRejection> {
        match self {
            GuardDecision::Allow(text) => Ok(text),
            GuardDecision::Reject(rejection) => Err(rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardRules {
    pub max_chars: usize,
    pub reject_control_chars: bool,
    pub url_patterns: Vec<String>,
    pub injection_phrases: Vec<String>,
    pub dangerous_patterns: Vec<String>,
}

impl Default for GuardRules {
    fn default() -> Self {
        Self {
            max_chars: 400,
            reject_control_chars: true,
            url_patterns: to_strings(&[
                r"\b(?:https?|ftp|file)://",
                r"\bwww\.[a-z0-9-]+\.[a-z]{2,}",
                r"\b[a-z0-9-]+\.(?:com|net|org|io|ru|cn|xyz|info|biz|app|dev)\b",
            ]),
            injection_phrases: to_strings(&[
                r"\b(?:ignore|disregard|forget|override|bypass)\b.{0,40}\b(?:previous|prior|above|earlier|your|system)\b.{0,20}\b(?:instructions?|directives?|rules|prompts?|guidelines)\b",
                r"\b(?:reveal|show|print|repeat|leak|output|display)\b.{0,30}\b(?:system|hidden|initial|original|secret)\s+(?:prompt|instructions?|message)",
                r"\byou\s+are\s+now\b",
                r"\bpretend\s+(?:to\s+be|you\s+are)\b",
                r"\bact\s+as\b.{0,30}\b(?:admin|administrator|developer|root|system|jailbroken)\b",
                r"\b(?:jailbreak|developer\s+mode|dan\s+mode)\b",
                r"(?:^|\s)(?:system|assistant)\s*:",
                r"<\|?\s*(?:im_start|im_end|system|endoftext)\s*\|?>",
                r"\bnew\s+instructions?\s*:",
            ]),
            dangerous_patterns: to_strings(&[
                r"\b(?:eval|exec|system)\s*\(",
                r"\brm\s+-rf\b",
                r"\b(?:curl|wget)\s+\S",
                r"(?:;|&&|\|\|)\s*(?:rm|curl|wget|sh|bash)\b",
                r"\$\([^)]*\)",
                r"<\s*script\b",
            ]),
        }
    }
}

fn to_strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

struct CompiledRule {
    category: RuleCategory,
    regex: Regex,
}

pub struct InputGuard {
    rules: Vec<CompiledRule>,
    max_chars: usize,
    reject_control_chars: bool,
}

static DEFAULT_GUARD: Lazy<InputGuard> =
    Lazy::new(|| InputGuard::new(&GuardRules::default()).expect("default guard rules compile"));

impl InputGuard {
    pub fn new(rules: &GuardRules) -> Result<Self> {
        let mut compiled = Vec::new();
        let groups = [
            (RuleCategory::Url, &rules.url_patterns),
            (RuleCategory::Injection, &rules.injection_phrases),
            (RuleCategory::Dangerous, &rules.dangerous_patterns),
        ];
        for (category, patterns) in groups {
            for pattern in patterns {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        RagError::Config(format!("invalid {category:?} guard pattern {pattern:?}: {e}"))
                    })?;
                compiled.push(CompiledRule { category, regex });
            }
        }
        Ok(Self {
            rules: compiled,
            max_chars: rules.max_chars.max(1),
            reject_control_chars: rules.reject_control_chars,
        })
    }

    pub fn with_defaults() -> &'static InputGuard {
        &DEFAULT_GUARD
    }

    pub fn check(&self, raw: &str) -> GuardDecision {
        let decision = self.evaluate(raw);
        if let GuardDecision::Reject(rejection) = &decision {
            warn!(category = ?rejection.category, "query rejected by input guard");
        }
        decision
    }

    fn evaluate(&self, raw: &str) -> GuardDecision {
        if self.reject_control_chars && raw.chars().any(is_disallowed_control) {
            return GuardDecision::Reject(GuardRejection::new(RuleCategory::ControlChars));
        }
        let canonical = normalize_line(raw);
        if canonical.is_empty() {
            return GuardDecision::Reject(GuardRejection::new(RuleCategory::Empty));
        }
        if let Some(rule) = self.rules.iter().find(|rule| rule.regex.is_match(&canonical)) {
            return GuardDecision::Reject(GuardRejection::new(rule.category));
        }
        GuardDecision::Allow(truncate_chars(&canonical, self.max_chars))
    }
}

/// C0/C1 controls other than ordinary line breaks and tabs, plus zero-width
/// and bidirectional override characters that can hide text.
fn is_disallowed_control(ch: char) -> bool {
    if matches!(ch, '\n' | '\r' | '\t') {
        return false;
    }
    ch.is_control()
        || matches!(
            ch,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{FEFF}'
        )
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
