//! Sentence and word-timestamp types, pseudo-alignment and warning rules.
//!
//! A sentence's `(start, end)` is fixed at its initial commit and survives
//! every later text replacement; replacements regenerate `words` by evenly
//! distributing the new characters across the preserved interval.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Confidence below which a sentence carries a `low_confidence` warning.
pub const WARNING_CONFIDENCE: f32 = 0.6;
/// Perplexity at or above which a sentence carries a `high_perplexity` warning.
pub const WARNING_PERPLEXITY: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub confidence: f32,
    pub is_pseudo: bool,
}

/// Where a sentence's current text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceSource {
    Primary,
    SecondaryPatch,
    LlmCorrection,
    LlmTranslation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceWarning {
    None,
    LowConfidence,
    HighPerplexity,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentence {
    /// Stable id, assigned at append and never reused.
    pub id: String,
    pub index: usize,
    /// VAD chunk this sentence came from; drives resume bookkeeping.
    pub chunk_index: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: f32,
    pub source: SentenceSource,
    pub is_modified: bool,
    pub original_text: Option<String>,
    pub alt_text: Option<String>,
    pub warning: SentenceWarning,
    pub perplexity: Option<f64>,
    pub translation: Option<String>,
    pub words: Vec<WordTimestamp>,
}

impl Sentence {
    pub fn new(
        index: usize,
        chunk_index: usize,
        start: f64,
        end: f64,
        text: String,
        confidence: f32,
        words: Vec<WordTimestamp>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            chunk_index,
            start,
            end,
            text,
            confidence,
            source: SentenceSource::Primary,
            is_modified: false,
            original_text: None,
            alt_text: None,
            warning: derive_warning(confidence, None),
            perplexity: None,
            translation: None,
            words,
        }
    }
}

/// Warning rule: low iff confidence under the threshold, high_perplexity iff
/// perplexity at or above its threshold, both if both.
pub fn derive_warning(confidence: f32, perplexity: Option<f64>) -> SentenceWarning {
    let low = confidence < WARNING_CONFIDENCE;
    let high = perplexity.map(|p| p >= WARNING_PERPLEXITY).unwrap_or(false);
    match (low, high) {
        (true, true) => SentenceWarning::Both,
        (true, false) => SentenceWarning::LowConfidence,
        (false, true) => SentenceWarning::HighPerplexity,
        (false, false) => SentenceWarning::None,
    }
}

/// Evenly distribute the non-whitespace characters of `text` across the
/// preserved `(start, end)` interval, one pseudo word per character.
pub fn pseudo_align(text: &str, start: f64, end: f64, confidence: f32) -> Vec<WordTimestamp> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let span = (end - start).max(0.0);
    let step = span / chars.len() as f64;
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| WordTimestamp {
            text: c.to_string(),
            start: start + i as f64 * step,
            end: start + (i + 1) as f64 * step,
            confidence,
            is_pseudo: true,
        })
        .collect()
}
