//! Stub engines — deterministic placeholders that exercise the full
//! pipeline without any model runtime.
//!
//! The server falls back to these when no engine commands are configured,
//! and the pipeline tests script them to drive specific fuse / patch /
//! proof paths.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::audio::AudioBuffer;
use crate::chunk::SeparationTier;
use crate::engines::{
    AsrWord, EngineProvider, LlmEngine, PrimaryAsrEngine, PrimaryTranscription, ProofResult,
    SecondaryAsrEngine, SecondaryTranscription, SeparatorEngine, TranslationResult, VadEngine,
    VadSegment,
};
use crate::error::Result;

/// Target chunk duration for the stub VAD.
const STUB_TARGET_SECS: f64 = 20.0;
/// Hard ceiling before an over-long speech run is chopped.
const STUB_MAX_SECS: f64 = 30.0;
/// Silence shorter than this merges the neighbouring speech blocks.
const STUB_MERGE_GAP_SECS: f64 = 0.5;

/// Energy-gated VAD: walks the audio in 20 ms frames, marks frames above an
/// RMS threshold as speech, merges adjacent blocks separated by short
/// silence toward the target duration and chops runs past the ceiling.
/// Never emits a zero-duration segment.
pub struct StubVad {
    threshold: f32,
}

impl StubVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for StubVad {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl VadEngine for StubVad {
    fn segment(&mut self, audio: &AudioBuffer) -> Result<Vec<VadSegment>> {
        if audio.is_empty() {
            return Ok(vec![]);
        }
        let frame = (audio.sample_rate as usize / 50).max(1); // 20 ms
        let rate = audio.sample_rate as f64;

        // 1. Raw speech runs.
        let mut runs: Vec<(f64, f64)> = Vec::new();
        let mut open: Option<f64> = None;
        for (i, window) in audio.samples.chunks(frame).enumerate() {
            let rms = (window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32).sqrt();
            let t0 = (i * frame) as f64 / rate;
            if rms >= self.threshold {
                if open.is_none() {
                    open = Some(t0);
                }
            } else if let Some(start) = open.take() {
                if t0 > start {
                    runs.push((start, t0));
                }
            }
        }
        if let Some(start) = open {
            let end = audio.duration_secs();
            if end > start {
                runs.push((start, end));
            }
        }

        // 2. Merge across short gaps while under the target duration.
        let mut merged: Vec<(f64, f64)> = Vec::new();
        for (start, end) in runs {
            match merged.last_mut() {
                Some((prev_start, prev_end))
                    if start - *prev_end <= STUB_MERGE_GAP_SECS
                        && end - *prev_start <= STUB_TARGET_SECS =>
                {
                    *prev_end = end;
                }
                _ => merged.push((start, end)),
            }
        }

        // 3. Chop anything past the ceiling into target-sized pieces.
        let mut segments: Vec<(f64, f64)> = Vec::new();
        for (start, end) in merged {
            let mut cursor = start;
            while end - cursor > STUB_MAX_SECS {
                segments.push((cursor, cursor + STUB_TARGET_SECS));
                cursor += STUB_TARGET_SECS;
            }
            if end > cursor {
                segments.push((cursor, end));
            }
        }

        Ok(segments
            .into_iter()
            .enumerate()
            .map(|(index, (start_sec, end_sec))| VadSegment {
                index,
                start_sec,
                end_sec,
            })
            .collect())
    }
}

/// Identity separator — returns the input unchanged, which trivially
/// preserves length and rate.
pub struct StubSeparator {
    tier: SeparationTier,
}

impl StubSeparator {
    pub fn new(tier: SeparationTier) -> Self {
        Self { tier }
    }
}

impl SeparatorEngine for StubSeparator {
    fn tier(&self) -> SeparationTier {
        self.tier
    }

    fn separate(&mut self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        debug!(tier = ?self.tier, samples = audio.samples.len(), "stub separation");
        Ok(audio.clone())
    }
}

/// Echo-style primary ASR: one word per second of audio, confidence 1.0.
pub struct StubPrimaryAsr {
    chunk_count: u32,
}

impl StubPrimaryAsr {
    pub fn new() -> Self {
        Self { chunk_count: 0 }
    }

    /// Chunks transcribed since construction.
    pub fn chunks_seen(&self) -> u32 {
        self.chunk_count
    }
}

impl Default for StubPrimaryAsr {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryAsrEngine for StubPrimaryAsr {
    fn transcribe(
        &mut self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> Result<PrimaryTranscription> {
        self.chunk_count += 1;
        if audio.samples.len() < 160 {
            return Ok(PrimaryTranscription::default());
        }
        let secs = audio.duration_secs().ceil() as usize;
        let per_word = audio.duration_secs() / secs.max(1) as f64;
        let words: Vec<AsrWord> = (0..secs.max(1))
            .map(|i| AsrWord {
                text: format!("word{}", i + 1),
                start: i as f64 * per_word,
                end: (i + 1) as f64 * per_word,
                confidence: 1.0,
            })
            .collect();
        let text = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(PrimaryTranscription {
            text_clean: text.clone(),
            text,
            avg_confidence: 1.0,
            words,
            event_tag: None,
            language: language_hint.map(str::to_owned),
        })
    }
}

/// Text-only echo for the secondary pass.
pub struct StubSecondaryAsr;

impl SecondaryAsrEngine for StubSecondaryAsr {
    fn transcribe_text_only(
        &mut self,
        audio: &AudioBuffer,
        _context_prompt: Option<&str>,
        _language_hint: Option<&str>,
    ) -> Result<SecondaryTranscription> {
        Ok(SecondaryTranscription {
            text: format!("[patched {} samples]", audio.samples.len()),
            avg_confidence: 0.95,
        })
    }
}

/// Pass-through LLM: proof returns the text untouched with a low
/// perplexity, translate wraps it.
pub struct StubLlm;

impl LlmEngine for StubLlm {
    fn proof(&mut self, text: &str, _context: &[String]) -> Result<ProofResult> {
        Ok(ProofResult {
            text: text.to_string(),
            perplexity: 10.0,
        })
    }

    fn translate(
        &mut self,
        text: &str,
        target_lang: &str,
        _context: &[String],
    ) -> Result<TranslationResult> {
        Ok(TranslationResult {
            text: format!("[{target_lang}] {text}"),
            confidence: 0.9,
        })
    }
}

/// Provider wiring all the stubs together.
pub struct StubEngineProvider;

impl EngineProvider for StubEngineProvider {
    fn load_vad(&self) -> Result<Box<dyn VadEngine>> {
        Ok(Box::new(StubVad::default()))
    }

    fn load_separator(&self, tier: SeparationTier) -> Result<Box<dyn SeparatorEngine>> {
        Ok(Box::new(StubSeparator::new(tier)))
    }

    fn load_primary_asr(&self) -> Result<Box<dyn PrimaryAsrEngine>> {
        Ok(Box::new(StubPrimaryAsr::new()))
    }

    fn load_secondary_asr(&self) -> Result<Box<dyn SecondaryAsrEngine>> {
        Ok(Box::new(StubSecondaryAsr))
    }

    fn load_llm(&self) -> Result<Box<dyn LlmEngine>> {
        Ok(Box::new(StubLlm))
    }
}

// ---------------------------------------------------------------------------
// Scripted engines (test support)
// ---------------------------------------------------------------------------

/// A scripted primary ASR that pops pre-arranged transcriptions per call.
/// Shared between the pipeline unit tests and the integration suite.
pub struct ScriptedPrimaryAsr {
    script: Arc<Mutex<VecDeque<PrimaryTranscription>>>,
}

impl ScriptedPrimaryAsr {
    pub fn new(script: Vec<PrimaryTranscription>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
        }
    }

    /// Build an engine over an existing script queue. Lets a provider hand
    /// out fresh engine instances (load/evict cycles) that keep consuming
    /// one scripted sequence.
    pub fn from_shared(script: Arc<Mutex<VecDeque<PrimaryTranscription>>>) -> Self {
        Self { script }
    }

    /// Share the underlying script so the test can refill or inspect it.
    pub fn handle(&self) -> Arc<Mutex<VecDeque<PrimaryTranscription>>> {
        Arc::clone(&self.script)
    }
}

impl PrimaryAsrEngine for ScriptedPrimaryAsr {
    fn transcribe(
        &mut self,
        _audio: &AudioBuffer,
        _language_hint: Option<&str>,
    ) -> Result<PrimaryTranscription> {
        Ok(self.script.lock().pop_front().unwrap_or_default())
    }
}

/// Fixed-interval VAD for tests: returns exactly the given segments.
pub struct ScriptedVad {
    segments: Vec<VadSegment>,
}

impl ScriptedVad {
    pub fn new(spans: &[(f64, f64)]) -> Self {
        Self {
            segments: spans
                .iter()
                .enumerate()
                .map(|(index, &(start_sec, end_sec))| VadSegment {
                    index,
                    start_sec,
                    end_sec,
                })
                .collect(),
        }
    }
}

impl VadEngine for ScriptedVad {
    fn segment(&mut self, _audio: &AudioBuffer) -> Result<Vec<VadSegment>> {
        Ok(self.segments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_vad_finds_loud_region() {
        let mut samples = vec![0.0f32; 16_000];
        samples.extend(vec![0.5f32; 32_000]);
        samples.extend(vec![0.0f32; 16_000]);
        let audio = AudioBuffer::new(samples, 16_000);

        let segs = StubVad::default().segment(&audio).unwrap();
        assert_eq!(segs.len(), 1);
        assert!((segs[0].start_sec - 1.0).abs() < 0.05);
        assert!((segs[0].end_sec - 3.0).abs() < 0.05);
        assert!(segs[0].duration() > 0.0);
    }

    #[test]
    fn stub_vad_silence_is_empty() {
        let audio = AudioBuffer::new(vec![0.0; 48_000], 16_000);
        assert!(StubVad::default().segment(&audio).unwrap().is_empty());
    }

    #[test]
    fn stub_vad_merges_across_short_gaps() {
        // Two speech bursts separated by 200 ms of silence: one segment.
        let mut samples = vec![0.5f32; 16_000];
        samples.extend(vec![0.0f32; 3_200]);
        samples.extend(vec![0.5f32; 16_000]);
        let audio = AudioBuffer::new(samples, 16_000);

        let segs = StubVad::default().segment(&audio).unwrap();
        assert_eq!(segs.len(), 1, "{segs:?}");
        assert!((segs[0].start_sec - 0.0).abs() < 0.05);
        assert!((segs[0].end_sec - 2.2).abs() < 0.05);
    }

    #[test]
    fn stub_vad_chops_overlong_runs() {
        // 50 s of continuous speech: no piece exceeds the 30 s ceiling and
        // every piece has positive duration.
        let audio = AudioBuffer::new(vec![0.5f32; 16_000 * 50], 16_000);
        let segs = StubVad::default().segment(&audio).unwrap();
        assert!(segs.len() >= 2);
        for s in &segs {
            assert!(s.duration() > 0.0);
            assert!(s.duration() <= 30.0 + 1e-6);
        }
        assert!((segs.last().unwrap().end_sec - 50.0).abs() < 0.05);
    }

    #[test]
    fn stub_separator_preserves_length_and_rate() {
        let audio = AudioBuffer::new(vec![0.3; 8_000], 16_000);
        let out = StubSeparator::new(SeparationTier::Light)
            .separate(&audio)
            .unwrap();
        assert_eq!(out.samples.len(), audio.samples.len());
        assert_eq!(out.sample_rate, audio.sample_rate);
    }

    #[test]
    fn scripted_asr_pops_in_order() {
        let mut asr = ScriptedPrimaryAsr::new(vec![
            PrimaryTranscription {
                text: "a".into(),
                ..Default::default()
            },
            PrimaryTranscription {
                text: "b".into(),
                ..Default::default()
            },
        ]);
        let audio = AudioBuffer::new(vec![0.1; 1_000], 16_000);
        assert_eq!(asr.transcribe(&audio, None).unwrap().text, "a");
        assert_eq!(asr.transcribe(&audio, None).unwrap().text, "b");
        assert_eq!(asr.transcribe(&audio, None).unwrap().text, "");
    }
}
