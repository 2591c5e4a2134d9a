//! Sentence boundary detection over primary-ASR word timestamps.
//!
//! Words accumulate until a boundary commits them: terminal punctuation, an
//! inter-word pause, a duration ceiling, or a character ceiling (with a
//! backwards search for the nearest weak-punctuation break). Sentences whose
//! stripped text is shorter than `min_chars` merge into the next one.

use serde::{Deserialize, Serialize};

use crate::engines::AsrWord;
use crate::subtitle::WordTimestamp;

const TERMINAL_PUNCT: &[char] = &['。', '？', '！', '?', '!'];
const WEAK_PUNCT: &[char] = &[',', '、', '；', '：'];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Inter-word gap (seconds) that forces a boundary.
    pub pause_threshold: f64,
    /// Maximum sentence duration in seconds.
    pub max_duration: f64,
    /// Maximum non-whitespace characters before a forced break.
    pub max_chars: usize,
    /// Sentences stripped shorter than this merge forward.
    pub min_chars: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 0.4,
            max_duration: 5.0,
            max_chars: 30,
            min_chars: 2,
        }
    }
}

/// A committed sentence before session bookkeeping: real word timestamps,
/// averaged confidence.
#[derive(Debug, Clone)]
pub struct SplitSentence {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: f32,
    pub words: Vec<WordTimestamp>,
}

fn ends_with_any(text: &str, set: &[char]) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map(|c| set.contains(&c))
        .unwrap_or(false)
}

fn stripped_len(words: &[AsrWord]) -> usize {
    words
        .iter()
        .map(|w| w.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum()
}

fn join_text(words: &[AsrWord]) -> String {
    words
        .iter()
        .map(|w| w.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn build_sentence(words: &[AsrWord]) -> SplitSentence {
    let confidence = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };
    SplitSentence {
        start: words.first().map(|w| w.start).unwrap_or(0.0),
        end: words.last().map(|w| w.end).unwrap_or(0.0),
        text: join_text(words),
        confidence,
        words: words
            .iter()
            .map(|w| WordTimestamp {
                text: w.text.clone(),
                start: w.start,
                end: w.end,
                confidence: w.confidence,
                is_pseudo: false,
            })
            .collect(),
    }
}

/// Split an ordered word list into sentences.
pub fn split_words(words: &[AsrWord], config: &SplitConfig) -> Vec<SplitSentence> {
    let mut sentences: Vec<SplitSentence> = Vec::new();
    let mut acc: Vec<AsrWord> = Vec::new();

    let mut commit = |acc: &mut Vec<AsrWord>, sentences: &mut Vec<SplitSentence>| {
        if acc.is_empty() {
            return;
        }
        // Too short to stand alone — leave it to merge into the next one.
        if stripped_len(acc) < config.min_chars {
            return;
        }
        sentences.push(build_sentence(acc));
        acc.clear();
    };

    for (i, word) in words.iter().enumerate() {
        acc.push(word.clone());

        if ends_with_any(&word.text, TERMINAL_PUNCT) {
            commit(&mut acc, &mut sentences);
            continue;
        }

        if let Some(next) = words.get(i + 1) {
            if next.start - word.end > config.pause_threshold {
                commit(&mut acc, &mut sentences);
                continue;
            }
        }

        let acc_start = acc.first().map(|w| w.start).unwrap_or(word.start);
        if word.end - acc_start >= config.max_duration {
            commit(&mut acc, &mut sentences);
            continue;
        }

        if stripped_len(&acc) >= config.max_chars {
            // Prefer the nearest weak-punctuation break inside the
            // accumulator; force a break at the current word otherwise.
            let break_at = acc
                .iter()
                .rposition(|w| ends_with_any(&w.text, WEAK_PUNCT));
            match break_at {
                Some(j) if j + 1 < acc.len() => {
                    let rest = acc.split_off(j + 1);
                    commit(&mut acc, &mut sentences);
                    // A sub-minimum head stays in the accumulator and
                    // prepends the carried remainder.
                    acc.extend(rest);
                }
                _ => commit(&mut acc, &mut sentences),
            }
        }
    }

    // Tail: emit whatever remains, even if short — there is no next
    // sentence left to merge into.
    if !acc.is_empty() && stripped_len(&acc) > 0 {
        sentences.push(build_sentence(&acc));
    }
    sentences
}
