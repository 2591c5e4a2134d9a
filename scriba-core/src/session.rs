//! Subtitle session — the mutable ordered sentence collection for one job.
//!
//! Owned by the runner; every mutation emits the matching `subtitle.*`
//! event. Text replacement preserves the committed `(start, end)` interval
//! and regenerates `words` by pseudo-alignment.

use std::sync::Arc;

use tracing::debug;

use crate::bus::EventBus;
use crate::events::{EventPayload, SentenceView};
use crate::pipeline::split::SplitSentence;
use crate::subtitle::{derive_warning, pseudo_align, Sentence, SentenceSource};

pub struct SubtitleSession {
    job_id: String,
    bus: Arc<EventBus>,
    sentences: Vec<Sentence>,
}

impl SubtitleSession {
    pub fn new(job_id: String, bus: Arc<EventBus>) -> Self {
        Self {
            job_id,
            bus,
            sentences: Vec::new(),
        }
    }

    /// Rebuild the session from checkpointed sentences without emitting
    /// events (resume path).
    pub fn restore(job_id: String, bus: Arc<EventBus>, sentences: Vec<Sentence>) -> Self {
        Self {
            job_id,
            bus,
            sentences,
        }
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sentence> {
        self.sentences.get(index)
    }

    /// Ordered snapshot of every sentence.
    pub fn all(&self) -> Vec<Sentence> {
        self.sentences.clone()
    }

    /// Append a freshly split sentence; assigns the next index and a stable
    /// id, emits `subtitle.primary_sentence`.
    pub fn append(&mut self, split: SplitSentence, chunk_index: usize) -> usize {
        let index = self.sentences.len();
        let sentence = Sentence::new(
            index,
            chunk_index,
            split.start,
            split.end,
            split.text,
            split.confidence,
            split.words,
        );
        self.bus.publish(
            &self.job_id,
            EventPayload::PrimarySentence {
                index,
                sentence: SentenceView::from(&sentence),
            },
        );
        debug!(index, chunk_index, "sentence committed");
        self.sentences.push(sentence);
        index
    }

    /// Replace a sentence's text in place. `(start, end)` is preserved,
    /// `original_text` is captured once, `words` is pseudo-aligned across
    /// the preserved interval and the warning is re-derived.
    pub fn replace_text(
        &mut self,
        index: usize,
        new_text: &str,
        source: SentenceSource,
        new_confidence: Option<f32>,
        new_perplexity: Option<f64>,
    ) -> bool {
        let Some(sentence) = self.sentences.get_mut(index) else {
            return false;
        };
        if sentence.original_text.is_none() {
            sentence.original_text = Some(sentence.text.clone());
        }
        sentence.alt_text = Some(std::mem::take(&mut sentence.text));
        sentence.text = new_text.to_string();
        sentence.source = source;
        sentence.is_modified = true;
        if let Some(c) = new_confidence {
            sentence.confidence = c;
        }
        if new_perplexity.is_some() {
            sentence.perplexity = new_perplexity;
        }
        sentence.words = pseudo_align(
            &sentence.text,
            sentence.start,
            sentence.end,
            sentence.confidence,
        );
        sentence.warning = derive_warning(sentence.confidence, sentence.perplexity);

        let view = SentenceView::from(&*sentence);
        let perplexity = sentence.perplexity;
        let payload = match source {
            SentenceSource::LlmCorrection => EventPayload::LlmProof {
                index,
                sentence: view,
                perplexity: perplexity.unwrap_or(0.0),
            },
            _ => EventPayload::SecondaryPatch {
                index,
                sentence: view,
            },
        };
        self.bus.publish(&self.job_id, payload);
        true
    }

    /// Attach a translation; emits `subtitle.llm_trans`.
    pub fn set_translation(&mut self, index: usize, translation: &str, confidence: f32) -> bool {
        let Some(sentence) = self.sentences.get_mut(index) else {
            return false;
        };
        sentence.translation = Some(translation.to_string());
        self.bus.publish(
            &self.job_id,
            EventPayload::LlmTrans {
                index,
                translation: translation.to_string(),
                confidence,
            },
        );
        true
    }

    /// The `k` sentence texts preceding `index`, oldest first. LLM prompt
    /// context.
    pub fn context_window(&self, index: usize, k: usize) -> Vec<String> {
        let hi = index.min(self.sentences.len());
        let lo = hi.saturating_sub(k);
        self.sentences[lo..hi].iter().map(|s| s.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitle::{SentenceWarning, WordTimestamp};
    use approx::assert_abs_diff_eq;

    fn split(start: f64, end: f64, text: &str, confidence: f32) -> SplitSentence {
        SplitSentence {
            start,
            end,
            text: text.into(),
            confidence,
            words: vec![WordTimestamp {
                text: text.into(),
                start,
                end,
                confidence,
                is_pseudo: false,
            }],
        }
    }

    fn session() -> (SubtitleSession, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (SubtitleSession::new("job".into(), Arc::clone(&bus)), bus)
    }

    #[test]
    fn append_assigns_sequential_indexes_and_emits() {
        let (mut s, bus) = session();
        assert_eq!(s.append(split(0.0, 1.0, "one", 0.9), 0), 0);
        assert_eq!(s.append(split(1.0, 2.0, "two", 0.9), 1), 1);

        let replay = bus.subscribe("job", Some(0)).replay;
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].payload.tag(), "subtitle.primary_sentence");
    }

    #[test]
    fn replace_preserves_interval_and_pseudo_aligns() {
        let (mut s, bus) = session();
        s.append(split(2.0, 6.0, "原文本", 0.4), 0);
        assert!(s.replace_text(0, "新的文本", SentenceSource::SecondaryPatch, Some(0.9), None));

        let sentence = s.get(0).unwrap();
        assert_eq!(sentence.start, 2.0);
        assert_eq!(sentence.end, 6.0);
        assert_eq!(sentence.text, "新的文本");
        assert_eq!(sentence.original_text.as_deref(), Some("原文本"));
        assert!(sentence.is_modified);
        assert_eq!(sentence.words.len(), 4);
        assert!(sentence.words.iter().all(|w| w.is_pseudo));
        let covered: f64 = sentence.words.iter().map(|w| w.end - w.start).sum();
        assert_abs_diff_eq!(covered, 4.0, epsilon = 1e-9);

        let tags: Vec<String> = bus
            .subscribe("job", Some(0))
            .replay
            .iter()
            .map(|e| e.payload.tag())
            .collect();
        assert_eq!(tags, vec!["subtitle.primary_sentence", "subtitle.secondary_patch"]);
    }

    #[test]
    fn original_text_is_captured_only_once() {
        let (mut s, _bus) = session();
        s.append(split(0.0, 1.0, "first", 0.4), 0);
        s.replace_text(0, "second", SentenceSource::SecondaryPatch, None, None);
        s.replace_text(0, "third", SentenceSource::LlmCorrection, None, Some(12.0));

        let sentence = s.get(0).unwrap();
        assert_eq!(sentence.original_text.as_deref(), Some("first"));
        assert_eq!(sentence.alt_text.as_deref(), Some("second"));
        assert_eq!(sentence.text, "third");
        assert_eq!(sentence.source, SentenceSource::LlmCorrection);
    }

    #[test]
    fn warning_recomputed_on_replace() {
        let (mut s, _bus) = session();
        s.append(split(0.0, 1.0, "x", 0.3), 0);
        assert_eq!(s.get(0).unwrap().warning, SentenceWarning::LowConfidence);

        s.replace_text(0, "y", SentenceSource::LlmCorrection, Some(0.9), Some(80.0));
        assert_eq!(s.get(0).unwrap().warning, SentenceWarning::HighPerplexity);
    }

    #[test]
    fn translation_emits_llm_trans() {
        let (mut s, bus) = session();
        s.append(split(0.0, 1.0, "hello", 0.9), 0);
        assert!(s.set_translation(0, "hola", 0.8));
        assert_eq!(s.get(0).unwrap().translation.as_deref(), Some("hola"));

        let replay = bus.subscribe("job", Some(0)).replay;
        assert_eq!(replay.last().unwrap().payload.tag(), "subtitle.llm_trans");
    }

    #[test]
    fn context_window_returns_preceding_texts() {
        let (mut s, _bus) = session();
        for (i, t) in ["a", "b", "c", "d"].iter().enumerate() {
            s.append(split(i as f64, i as f64 + 1.0, t, 0.9), i);
        }
        assert_eq!(s.context_window(3, 2), vec!["b", "c"]);
        assert_eq!(s.context_window(0, 2), Vec::<String>::new());
        assert_eq!(s.context_window(2, 10), vec!["a", "b"]);
    }

    #[test]
    fn replace_out_of_range_is_a_noop() {
        let (mut s, _bus) = session();
        assert!(!s.replace_text(7, "x", SentenceSource::SecondaryPatch, None, None));
        assert!(!s.set_translation(7, "x", 0.5));
    }
}
