//! Engine adapter contracts.
//!
//! Every model-backed collaborator (VAD, separator, primary/secondary ASR,
//! LLM) hides behind one of these traits. `&mut self` intentionally
//! expresses that engines are stateful — decoder caches, RNN hidden state,
//! subprocess handles — and all mutation is serialised through the model
//! manager's handles.
//!
//! Adapters must be safe for sequential reuse; the runner never calls an
//! engine concurrently for the same job.

pub mod command;
pub mod stub;

use serde::{Deserialize, Serialize};

use crate::audio::AudioBuffer;
use crate::chunk::SeparationTier;
use crate::error::Result;

/// One VAD speech interval. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadSegment {
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
}

impl VadSegment {
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }
}

/// A word with its time span as reported by the primary ASR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrWord {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub confidence: f32,
}

/// Primary ASR output for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimaryTranscription {
    pub text: String,
    /// Text with ambient-audio markers stripped.
    pub text_clean: String,
    pub avg_confidence: f32,
    pub words: Vec<AsrWord>,
    /// Ambient-audio label (e.g. "BGM", "Noise") when the engine tagged the
    /// chunk; consumed by the fuse controller.
    pub event_tag: Option<String>,
    pub language: Option<String>,
}

/// Secondary ASR output. Timestamps from this engine are intentionally
/// absent — the primary defines the time axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryTranscription {
    pub text: String,
    pub avg_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofResult {
    pub text: String,
    pub perplexity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub text: String,
    pub confidence: f32,
}

/// Voice-activity detection over a whole job's audio.
///
/// Implementations target 15–30 s segments, merging adjacent speech blocks
/// to reach the target, and must never produce a zero-duration segment. An
/// empty list is a legitimate "no speech" outcome, not an error.
pub trait VadEngine: Send + 'static {
    fn segment(&mut self, audio: &AudioBuffer) -> Result<Vec<VadSegment>>;
}

/// Source separation at a fixed tier. Output preserves input length and
/// sample rate; content is voice-prominent.
pub trait SeparatorEngine: Send + 'static {
    fn tier(&self) -> SeparationTier;
    fn separate(&mut self, audio: &AudioBuffer) -> Result<AudioBuffer>;
}

/// First-pass transcription. Defines the authoritative time axis.
pub trait PrimaryAsrEngine: Send + 'static {
    fn transcribe(
        &mut self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> Result<PrimaryTranscription>;
}

/// Accurate second-pass transcription, text only.
pub trait SecondaryAsrEngine: Send + 'static {
    fn transcribe_text_only(
        &mut self,
        audio: &AudioBuffer,
        context_prompt: Option<&str>,
        language_hint: Option<&str>,
    ) -> Result<SecondaryTranscription>;
}

/// Proofreading / translation over committed sentence text.
pub trait LlmEngine: Send + 'static {
    fn proof(&mut self, text: &str, context: &[String]) -> Result<ProofResult>;
    fn translate(
        &mut self,
        text: &str,
        target_lang: &str,
        context: &[String],
    ) -> Result<TranslationResult>;
}

/// Constructs engines on demand. The model manager owns the only instance
/// and serialises all loads behind its exclusion lock.
pub trait EngineProvider: Send + Sync + 'static {
    fn load_vad(&self) -> Result<Box<dyn VadEngine>>;
    fn load_separator(&self, tier: SeparationTier) -> Result<Box<dyn SeparatorEngine>>;
    fn load_primary_asr(&self) -> Result<Box<dyn PrimaryAsrEngine>>;
    fn load_secondary_asr(&self) -> Result<Box<dyn SecondaryAsrEngine>>;
    fn load_llm(&self) -> Result<Box<dyn LlmEngine>>;
}

/// Secondary-ASR confidence from raw decoder statistics:
/// `min(1, max(0, 1 + avg_logprob)) × (1 − avg_no_speech_prob)`.
pub fn secondary_confidence(avg_logprob: f32, avg_no_speech_prob: f32) -> f32 {
    (1.0 + avg_logprob).clamp(0.0, 1.0) * (1.0 - avg_no_speech_prob.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_confidence_clamps() {
        assert_eq!(secondary_confidence(0.0, 0.0), 1.0);
        assert_eq!(secondary_confidence(-2.0, 0.0), 0.0);
        let c = secondary_confidence(-0.5, 0.2);
        assert!((c - 0.4).abs() < 1e-6);
    }
}
