//! Blocking per-job pipeline runner.
//!
//! ## Stages
//!
//! ```text
//! 1. extract   — ffmpeg → mono 16 kHz PCM + audio.wav artifact + peaks
//! 2. vad       — speech segments (empty list = empty subtitle, still FINISHED)
//! 3. bgm_detect— spectrum diagnosis per chunk
//! 4. demucs    — selective pre-separation, one separator acquisition per tier
//! 5. primary_asr — per-chunk transcribe + fuse loop (the one place control
//!                  re-enters an earlier engine, modeled as an explicit
//!                  per-chunk state machine)
//! 6. post-enhance — secondary patch / LLM proof / LLM translate per preset
//! 7. srt       — serialize and persist output.srt
//! 8. finalize  — checkpoint FINISHED, signal.job_complete
//! ```
//!
//! The whole loop is synchronous and runs inside `spawn_blocking`; the
//! cancel/pause flags are polled between stages and between chunks, never
//! mid-chunk, so in-flight model calls always complete.

pub mod split;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, error, info, warn};

use crate::audio::AudioBuffer;
use crate::bus::EventBus;
use crate::checkpoint::CheckpointStore;
use crate::chunk::{ChunkState, SeparationTier};
use crate::engines::{PrimaryTranscription, VadSegment};
use crate::error::{Result, ScribaError};
use crate::events::{EventPayload, Signal};
use crate::fuse::{self, FuseDecision};
use crate::hardware::HardwarePolicy;
use crate::job::{JobErrorRecord, JobManifest, Phase, StageMode, StagePlan};
use crate::media;
use crate::models::{ModelManager, ModelSlot};
use crate::progress::ProgressTracker;
use crate::queue::JobStore;
use crate::session::SubtitleSession;
use crate::spectrum::{SpectrumClassifier, SpectrumDiagnosis};
use crate::subtitle::Sentence;

/// Cooperative control flags for one running job.
#[derive(Clone, Default)]
pub struct JobControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancel,
    Pause,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Checked at stage and chunk boundaries. Cancel wins over pause.
    pub fn poll(&self) -> Option<Interrupt> {
        if self.cancel.load(Ordering::SeqCst) {
            Some(Interrupt::Cancel)
        } else if self.pause.load(Ordering::SeqCst) {
            Some(Interrupt::Pause)
        } else {
            None
        }
    }
}

/// Everything a runner needs, passed as one struct so the spawn site stays
/// tidy.
pub struct RunnerContext {
    pub manifest: JobManifest,
    pub models: Arc<ModelManager>,
    pub bus: Arc<EventBus>,
    pub checkpoints: Arc<CheckpointStore>,
    pub store: Arc<JobStore>,
    pub policy: HardwarePolicy,
    pub classifier: SpectrumClassifier,
    pub control: JobControl,
    /// Sentences restored from the checkpoint on resume.
    pub restored_sentences: Vec<Sentence>,
}

/// How a runner exited. The scheduler applies the matching status
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Paused,
    Canceled,
    Failed,
}

struct Runner {
    manifest: JobManifest,
    models: Arc<ModelManager>,
    bus: Arc<EventBus>,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<JobStore>,
    policy: HardwarePolicy,
    classifier: SpectrumClassifier,
    control: JobControl,
    tracker: ProgressTracker,
    session: SubtitleSession,
}

/// Run one job to completion (or interruption). Blocking.
pub fn run(ctx: RunnerContext) -> RunOutcome {
    let job_id = ctx.manifest.job_id.clone();
    let tracker = ProgressTracker::new(
        job_id.clone(),
        ctx.manifest.settings.preset,
        Arc::clone(&ctx.bus),
    );
    let session = if ctx.restored_sentences.is_empty() {
        SubtitleSession::new(job_id.clone(), Arc::clone(&ctx.bus))
    } else {
        info!(
            job_id,
            restored = ctx.restored_sentences.len(),
            "resuming with checkpointed sentences"
        );
        SubtitleSession::restore(
            job_id.clone(),
            Arc::clone(&ctx.bus),
            ctx.restored_sentences,
        )
    };

    let mut runner = Runner {
        manifest: ctx.manifest,
        models: ctx.models,
        bus: ctx.bus,
        checkpoints: ctx.checkpoints,
        store: ctx.store,
        policy: ctx.policy,
        classifier: ctx.classifier,
        control: ctx.control,
        tracker,
        session,
    };
    runner.run_job()
}

impl Runner {
    fn run_job(&mut self) -> RunOutcome {
        let job_id = self.manifest.job_id.clone();
        info!(job_id, "pipeline started");
        self.signal(Signal::JobStart, None);

        match self.run_stages() {
            Ok(outcome) => {
                let snap = self.tracker.percent();
                info!(job_id, ?outcome, percent = snap, "pipeline exited");
                outcome
            }
            Err(e) => {
                error!(job_id, error = %e, "pipeline failed");
                self.manifest.error = Some(JobErrorRecord {
                    kind: error_kind(&e).to_string(),
                    message: e.to_string(),
                });
                self.manifest.message = e.to_string();
                self.signal(Signal::JobFailed, Some(e.to_string()));
                self.checkpoint();
                RunOutcome::Failed
            }
        }
    }

    fn run_stages(&mut self) -> Result<RunOutcome> {
        // ── 1. Extract ───────────────────────────────────────────────────
        let audio = self.stage_extract()?;
        if let Some(exit) = self.boundary() {
            return Ok(exit);
        }

        // ── 2. VAD ───────────────────────────────────────────────────────
        let segments = self.stage_vad(&audio)?;
        if let Some(exit) = self.boundary() {
            return Ok(exit);
        }

        if segments.is_empty() {
            // Legitimate outcome: no speech, empty subtitle, still FINISHED.
            info!(job_id = self.manifest.job_id, "no speech detected");
            for phase in [
                Phase::BgmDetect,
                Phase::Demucs,
                Phase::PrimaryAsr,
                Phase::SecondaryPatch,
                Phase::LlmProof,
                Phase::LlmTrans,
            ] {
                self.tracker.start_phase(phase, 0, "skipped — no speech");
                self.tracker.complete_phase(phase);
            }
            self.stage_srt()?;
            return Ok(self.finalize());
        }

        let mut chunks = build_chunks(&audio, &segments);

        // ── 3. Diagnose ──────────────────────────────────────────────────
        let diagnoses = self.stage_diagnose(&chunks)?;
        if let Some(exit) = self.boundary() {
            return Ok(exit);
        }

        // ── 4. Pre-separate (selective) ──────────────────────────────────
        if let Some(exit) = self.stage_preseparate(&mut chunks, &diagnoses)? {
            return Ok(exit);
        }

        // ── 5. Transcribe + fuse loop ────────────────────────────────────
        if let Some(exit) = self.stage_transcribe(&mut chunks)? {
            return Ok(exit);
        }

        // ── 6. Post-enhance ──────────────────────────────────────────────
        if let Some(exit) = self.stage_enhance(&chunks)? {
            return Ok(exit);
        }

        // ── 7. SRT ───────────────────────────────────────────────────────
        self.stage_srt()?;

        // ── 8. Finalize ──────────────────────────────────────────────────
        Ok(self.finalize())
    }

    // ── Stage implementations ───────────────────────────────────────────

    fn stage_extract(&mut self) -> Result<AudioBuffer> {
        self.tracker.start_phase(Phase::Extract, 1, "extracting audio");
        self.enter_phase(Phase::Extract);

        let job_id = self.manifest.job_id.clone();
        let wav_path = self.checkpoints.audio_path(&job_id);
        let audio = if wav_path.exists() {
            debug!(job_id, "reusing extracted audio artifact");
            media::read_wav(&wav_path)?
        } else {
            media::extract_audio(&self.manifest.input_path, &wav_path)?
        };

        if self.manifest.duration_secs.is_none() {
            let duration = media::probe_duration(&self.manifest.input_path)
                .unwrap_or_else(|_| audio.duration_secs());
            self.manifest.duration_secs = Some(duration);
        }

        // Waveform overview for the editor; failure is not fatal.
        let peaks = media::PeaksFile {
            duration: audio.duration_secs(),
            peaks: media::compute_peaks(&audio, 1_000),
        };
        if let Ok(json) = serde_json::to_vec(&peaks) {
            if let Err(e) = std::fs::write(self.checkpoints.peaks_path(&job_id), json) {
                warn!(job_id, error = %e, "could not write peaks.json");
            }
        }

        self.tracker.complete_phase(Phase::Extract);
        self.checkpoint();
        Ok(audio)
    }

    fn stage_vad(&mut self, audio: &AudioBuffer) -> Result<Vec<VadSegment>> {
        self.tracker.start_phase(Phase::Vad, 1, "detecting speech");
        self.enter_phase(Phase::Vad);

        let vad = self.models.acquire_vad()?;
        let segments = match vad.with(|v| v.segment(audio)) {
            Ok(segments) => segments,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "VAD failed — retrying once");
                vad.with(|v| v.segment(audio))?
            }
            Err(e) => return Err(e),
        };
        self.models.release(ModelSlot::Vad);

        info!(count = segments.len(), "VAD segments");
        self.tracker.complete_phase(Phase::Vad);
        self.checkpoint();
        Ok(segments)
    }

    fn stage_diagnose(&mut self, chunks: &[ChunkState]) -> Result<Vec<SpectrumDiagnosis>> {
        self.tracker
            .start_phase(Phase::BgmDetect, chunks.len(), "classifying chunks");
        self.enter_phase(Phase::BgmDetect);

        let mut diagnoses = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let d = self.classifier.diagnose(chunk.index, chunk.audio.current());
            debug!(
                chunk = chunk.index,
                verdict = ?d.verdict,
                music = d.music_score,
                noise = d.noise_score,
                "chunk diagnosed"
            );
            diagnoses.push(d);
            self.tracker
                .update(Phase::BgmDetect, i + 1, "classifying chunks");
        }
        self.tracker.complete_phase(Phase::BgmDetect);
        self.checkpoint();
        Ok(diagnoses)
    }

    fn stage_preseparate(
        &mut self,
        chunks: &mut [ChunkState],
        diagnoses: &[SpectrumDiagnosis],
    ) -> Result<Option<RunOutcome>> {
        // Pair each flagged chunk with the tier the policy actually permits.
        let flagged: Vec<(usize, SeparationTier)> = if self.policy.enable_separation {
            diagnoses
                .iter()
                .filter_map(|d| {
                    d.recommended_separator
                        .as_tier()
                        .map(|t| (d.chunk_index, self.clamp_tier(t)))
                })
                .collect()
        } else {
            Vec::new()
        };

        self.tracker
            .start_phase(Phase::Demucs, flagged.len(), "separating vocals");
        self.enter_phase(Phase::Demucs);

        // One acquisition per tier batch amortizes the model load.
        let mut done = 0usize;
        for tier in [SeparationTier::Light, SeparationTier::Heavy] {
            let batch: Vec<usize> = flagged
                .iter()
                .filter(|(_, t)| *t == tier)
                .map(|(i, _)| *i)
                .collect();
            if batch.is_empty() {
                continue;
            }
            let separator = match self.models.acquire_separator(tier) {
                Ok(s) => s,
                Err(e) => {
                    // Degrade: skip separation, chunks stay unseparated.
                    warn!(error = %e, ?tier, "separator unavailable — skipping pre-separation");
                    continue;
                }
            };
            for idx in batch {
                let chunk = &mut chunks[idx];
                match separator.with(|s| s.separate(chunk.audio.original())) {
                    Ok(separated) => chunk.apply_separation(tier, separated),
                    Err(e) => {
                        warn!(chunk = idx, error = %e, "separation failed — keeping original")
                    }
                }
                done += 1;
                self.tracker.update(Phase::Demucs, done, "separating vocals");
                if let Some(exit) = self.boundary_with(|r| r.models.evict(ModelSlot::Separator)) {
                    return Ok(Some(exit));
                }
            }
        }
        self.models.evict(ModelSlot::Separator);

        self.tracker.complete_phase(Phase::Demucs);
        self.checkpoint();
        Ok(self.boundary())
    }

    fn stage_transcribe(&mut self, chunks: &mut [ChunkState]) -> Result<Option<RunOutcome>> {
        self.tracker
            .start_phase(Phase::PrimaryAsr, chunks.len(), "transcribing");
        self.enter_phase(Phase::PrimaryAsr);

        let start_from = self.manifest.completed_chunks;
        if start_from > 0 {
            info!(start_from, "resuming transcription from first untranscribed chunk");
            self.tracker
                .update(Phase::PrimaryAsr, start_from, "transcribing");
        }

        let settings = self.manifest.settings.clone();
        let mut asr = self.models.acquire_primary_asr()?;

        for i in start_from..chunks.len() {
            let chunk = &mut chunks[i];

            // Explicit per-chunk state machine: transcribe, let the fuse
            // controller decide, possibly swap models and go again.
            let transcription = loop {
                let result = transcribe_once(
                    &asr,
                    chunk.audio.current(),
                    settings.language_hint.as_deref(),
                );
                let t = match result {
                    Ok(t) => t,
                    Err(e) if e.is_transient() => {
                        warn!(chunk = i, error = %e, "transcription failed — retrying once");
                        transcribe_once(
                            &asr,
                            chunk.audio.current(),
                            settings.language_hint.as_deref(),
                        )?
                    }
                    Err(e) => return Err(e),
                };

                let decision = fuse::decide(
                    chunk,
                    t.avg_confidence,
                    t.event_tag.as_deref(),
                    settings.fuse_confidence_threshold,
                );
                match decision {
                    FuseDecision::Accept => break t,
                    FuseDecision::UpgradeSeparation { tier } => {
                        if !self.policy.enable_separation {
                            debug!(chunk = i, "fuse upgrade requested but separation disabled");
                            break t;
                        }
                        let tier = self.clamp_tier(tier);
                        info!(
                            chunk = i,
                            ?tier,
                            confidence = t.avg_confidence,
                            tag = t.event_tag.as_deref().unwrap_or(""),
                            "fuse: upgrading separation"
                        );
                        // Memory-bounded swap: ASR out, separator in, then back.
                        self.models.evict(ModelSlot::PrimaryAsr);
                        let separated = {
                            let separator = self.models.acquire_separator(tier)?;
                            let out = separator.with(|s| s.separate(chunk.audio.original()));
                            self.models.evict(ModelSlot::Separator);
                            out
                        };
                        asr = self.models.acquire_primary_asr()?;
                        match separated {
                            Ok(buf) => {
                                chunk.apply_separation(tier, buf);
                                chunk.record_fuse_retry();
                            }
                            Err(e) => {
                                warn!(chunk = i, error = %e, "fuse separation failed — accepting");
                                break t;
                            }
                        }
                    }
                }
            };

            self.commit_chunk(chunk, &transcription);
            self.tracker
                .update(Phase::PrimaryAsr, i + 1, "transcribing");

            if let Some(exit) = self.boundary() {
                return Ok(Some(exit));
            }
        }

        self.models.release(ModelSlot::PrimaryAsr);
        self.tracker.complete_phase(Phase::PrimaryAsr);
        self.checkpoint();
        Ok(None)
    }

    /// Split one accepted transcription into sentences and commit them,
    /// checkpointing on every commit. Empty text commits nothing but still
    /// advances progress.
    fn commit_chunk(&mut self, chunk: &ChunkState, t: &PrimaryTranscription) {
        let words: Vec<_> = t
            .words
            .iter()
            .map(|w| crate::engines::AsrWord {
                text: w.text.clone(),
                start: w.start + chunk.start,
                end: w.end + chunk.start,
                confidence: w.confidence,
            })
            .collect();
        let sentences = split::split_words(&words, &self.manifest.settings.split);
        if sentences.is_empty() {
            debug!(chunk = chunk.index, "no sentences from chunk");
        }
        for s in sentences {
            self.session.append(s, chunk.index);
            self.sync_store();
            self.checkpoint();
        }
        self.manifest.completed_chunks = chunk.index + 1;
        self.sync_store();
        self.checkpoint();
    }

    fn stage_enhance(&mut self, chunks: &[ChunkState]) -> Result<Option<RunOutcome>> {
        let plan = self.manifest.settings.preset.stages();

        if let Some(exit) = self.stage_secondary_patch(chunks, &plan)? {
            return Ok(Some(exit));
        }
        if let Some(exit) = self.stage_llm_proof(&plan)? {
            return Ok(Some(exit));
        }
        if let Some(exit) = self.stage_llm_trans(&plan)? {
            return Ok(Some(exit));
        }
        Ok(None)
    }

    fn stage_secondary_patch(
        &mut self,
        chunks: &[ChunkState],
        plan: &StagePlan,
    ) -> Result<Option<RunOutcome>> {
        if !plan.secondary_patch.enabled() {
            return Ok(None);
        }
        let threshold = self.manifest.settings.patch_threshold;
        let targets: Vec<usize> = self
            .session
            .all()
            .iter()
            .filter(|s| plan.secondary_patch == StageMode::Full || s.confidence < threshold)
            .map(|s| s.index)
            .collect();

        self.tracker
            .start_phase(Phase::SecondaryPatch, targets.len(), "patching low-confidence text");
        self.enter_phase(Phase::SecondaryPatch);

        if !targets.is_empty() {
            let asr = match self.models.acquire_secondary_asr() {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "secondary ASR unavailable — skipping patch stage");
                    self.tracker.complete_phase(Phase::SecondaryPatch);
                    return Ok(self.boundary());
                }
            };
            let language = self.manifest.settings.language_hint.clone();
            for (n, index) in targets.iter().enumerate() {
                let Some(sentence) = self.session.get(*index).cloned() else {
                    continue;
                };
                let Some(chunk) = chunks.get(sentence.chunk_index) else {
                    continue;
                };
                let slice = chunk.audio.current().slice_secs(
                    sentence.start - chunk.start,
                    sentence.end - chunk.start,
                );
                let context = self.session.context_window(*index, 1).pop();

                let result = asr.with(|a| {
                    a.transcribe_text_only(&slice, context.as_deref(), language.as_deref())
                });
                match result {
                    Ok(patch) if !patch.text.trim().is_empty() => {
                        // Timestamps from this engine are discarded by
                        // construction; only text and confidence flow in.
                        self.session.replace_text(
                            *index,
                            &patch.text,
                            crate::subtitle::SentenceSource::SecondaryPatch,
                            Some(patch.avg_confidence),
                            None,
                        );
                        self.sync_store();
                        self.checkpoint();
                    }
                    Ok(_) => debug!(index, "secondary patch returned empty text — keeping"),
                    Err(e) if e.is_transient() => {
                        warn!(index, error = %e, "secondary patch failed — keeping sentence")
                    }
                    Err(e) => {
                        warn!(error = %e, "secondary ASR lost — skipping rest of patch stage");
                        break;
                    }
                }
                self.tracker
                    .update(Phase::SecondaryPatch, n + 1, "patching low-confidence text");
                if let Some(exit) = self.boundary_with(|r| r.models.evict(ModelSlot::SecondaryAsr)) {
                    return Ok(Some(exit));
                }
            }
            self.models.evict(ModelSlot::SecondaryAsr);
        }

        self.tracker.complete_phase(Phase::SecondaryPatch);
        self.checkpoint();
        Ok(self.boundary())
    }

    fn stage_llm_proof(&mut self, plan: &StagePlan) -> Result<Option<RunOutcome>> {
        if !plan.llm_proof.enabled() {
            return Ok(None);
        }
        let targets: Vec<usize> = self
            .session
            .all()
            .iter()
            .filter(|s| {
                plan.llm_proof == StageMode::Full
                    || s.warning != crate::subtitle::SentenceWarning::None
            })
            .map(|s| s.index)
            .collect();

        self.tracker
            .start_phase(Phase::LlmProof, targets.len(), "proofreading");
        self.enter_phase(Phase::LlmProof);

        if !targets.is_empty() {
            let llm = match self.models.acquire_llm() {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "LLM unavailable — skipping proof stage");
                    self.tracker.complete_phase(Phase::LlmProof);
                    return Ok(self.boundary());
                }
            };
            for (n, index) in targets.iter().enumerate() {
                let Some(sentence) = self.session.get(*index).cloned() else {
                    continue;
                };
                let context = self.session.context_window(*index, 3);
                match llm.with(|l| l.proof(&sentence.text, &context)) {
                    Ok(proof) => {
                        self.session.replace_text(
                            *index,
                            &proof.text,
                            crate::subtitle::SentenceSource::LlmCorrection,
                            None,
                            Some(proof.perplexity),
                        );
                        self.sync_store();
                        self.checkpoint();
                    }
                    Err(e) if e.is_transient() => {
                        warn!(index, error = %e, "proof failed — keeping sentence")
                    }
                    Err(e) => {
                        warn!(error = %e, "LLM lost — skipping rest of proof stage");
                        break;
                    }
                }
                self.tracker.update(Phase::LlmProof, n + 1, "proofreading");
                if let Some(exit) = self.boundary() {
                    return Ok(Some(exit));
                }
            }
        }

        self.tracker.complete_phase(Phase::LlmProof);
        self.checkpoint();
        Ok(self.boundary())
    }

    fn stage_llm_trans(&mut self, plan: &StagePlan) -> Result<Option<RunOutcome>> {
        if !plan.llm_trans.enabled() {
            return Ok(None);
        }
        let target_lang = self
            .manifest
            .settings
            .target_language
            .clone()
            .unwrap_or_else(|| "en".into());
        let targets: Vec<usize> = self
            .session
            .all()
            .iter()
            .filter(|s| {
                plan.llm_trans == StageMode::Full
                    || s.confidence >= crate::subtitle::WARNING_CONFIDENCE
            })
            .map(|s| s.index)
            .collect();

        self.tracker
            .start_phase(Phase::LlmTrans, targets.len(), "translating");
        self.enter_phase(Phase::LlmTrans);

        if !targets.is_empty() {
            let llm = match self.models.acquire_llm() {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "LLM unavailable — skipping translation stage");
                    self.tracker.complete_phase(Phase::LlmTrans);
                    return Ok(self.boundary());
                }
            };
            for (n, index) in targets.iter().enumerate() {
                let Some(sentence) = self.session.get(*index).cloned() else {
                    continue;
                };
                let context = self.session.context_window(*index, 3);
                match llm.with(|l| l.translate(&sentence.text, &target_lang, &context)) {
                    Ok(t) => {
                        self.session.set_translation(*index, &t.text, t.confidence);
                        self.sync_store();
                        self.checkpoint();
                    }
                    Err(e) if e.is_transient() => {
                        warn!(index, error = %e, "translation failed — skipping sentence")
                    }
                    Err(e) => {
                        warn!(error = %e, "LLM lost — skipping rest of translation stage");
                        break;
                    }
                }
                self.tracker.update(Phase::LlmTrans, n + 1, "translating");
                if let Some(exit) = self.boundary() {
                    return Ok(Some(exit));
                }
            }
        }

        self.tracker.complete_phase(Phase::LlmTrans);
        self.checkpoint();
        Ok(self.boundary())
    }

    fn stage_srt(&mut self) -> Result<()> {
        self.tracker.start_phase(Phase::Srt, 1, "writing subtitles");
        self.enter_phase(Phase::Srt);

        let srt = crate::srt::serialize(&self.session.all());
        let path = self.checkpoints.srt_path(&self.manifest.job_id);
        std::fs::write(&path, srt.as_bytes())
            .map_err(|e| ScribaError::MediaTool(format!("write srt: {e}")))?;
        info!(path = %path.display(), sentences = self.session.len(), "SRT written");

        self.tracker.complete_phase(Phase::Srt);
        self.checkpoint();
        Ok(())
    }

    fn finalize(&mut self) -> RunOutcome {
        self.manifest.progress = self.tracker.percent();
        self.manifest.message = "finished".into();
        self.signal(Signal::JobComplete, None);
        self.checkpoint();
        RunOutcome::Finished
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Clamp a requested tier to what the hardware policy allows.
    fn clamp_tier(&self, requested: SeparationTier) -> SeparationTier {
        match self.policy.separator_tier {
            Some(cap) if requested > cap => cap,
            _ => requested,
        }
    }

    /// Stage/chunk-boundary control check. Checkpoints before yielding.
    fn boundary(&mut self) -> Option<RunOutcome> {
        self.boundary_with(|_| {})
    }

    fn boundary_with(&mut self, cleanup: impl FnOnce(&mut Self)) -> Option<RunOutcome> {
        match self.control.poll() {
            None => None,
            Some(Interrupt::Cancel) => {
                cleanup(self);
                info!(job_id = self.manifest.job_id, "canceled at boundary");
                self.manifest.message = "canceled".into();
                self.signal(Signal::JobCanceled, None);
                self.checkpoint();
                Some(RunOutcome::Canceled)
            }
            Some(Interrupt::Pause) => {
                cleanup(self);
                info!(job_id = self.manifest.job_id, "paused at boundary");
                self.manifest.message = "paused".into();
                self.checkpoint();
                Some(RunOutcome::Paused)
            }
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        self.manifest.phase = Some(phase);
        self.manifest.progress = self.tracker.percent();
        self.sync_store();
    }

    fn signal(&self, signal: Signal, message: Option<String>) {
        self.bus
            .publish(&self.manifest.job_id, EventPayload::Signal { signal, message });
    }

    /// Persist manifest + sentences. IO failures are logged, never fatal.
    fn checkpoint(&mut self) {
        self.manifest.updated_at = chrono::Utc::now();
        self.manifest.progress = self.tracker.percent();
        self.manifest.last_event_seq = self.bus.last_seq(&self.manifest.job_id);
        if let Err(e) = self.checkpoints.save_manifest(&self.manifest) {
            warn!(job_id = self.manifest.job_id, error = %e, "checkpoint write failed");
        }
        if let Err(e) = self
            .checkpoints
            .save_sentences(&self.manifest.job_id, &self.session.all())
        {
            warn!(job_id = self.manifest.job_id, error = %e, "segments write failed");
        }
    }

    /// Mirror runner-owned state into the shared store for readers.
    fn sync_store(&self) {
        let manifest = self.manifest.clone();
        let sentences = self.session.all();
        self.store.update(&self.manifest.job_id, move |record| {
            record.manifest.phase = manifest.phase;
            record.manifest.progress = manifest.progress;
            record.manifest.message = manifest.message.clone();
            record.manifest.completed_chunks = manifest.completed_chunks;
            record.manifest.duration_secs = manifest.duration_secs;
            record.manifest.updated_at = manifest.updated_at;
            record.sentences = sentences.clone();
        });
    }
}

fn transcribe_once(
    asr: &crate::models::EngineHandle<dyn crate::engines::PrimaryAsrEngine>,
    audio: &AudioBuffer,
    language_hint: Option<&str>,
) -> Result<PrimaryTranscription> {
    asr.with(|a| a.transcribe(audio, language_hint))
}

/// Initialize the chunk graph: one state per VAD segment with the audio
/// slice copied into the immutable original.
fn build_chunks(audio: &AudioBuffer, segments: &[VadSegment]) -> Vec<ChunkState> {
    segments
        .iter()
        .map(|seg| {
            ChunkState::new(
                seg.index,
                seg.start_sec,
                seg.end_sec,
                audio.slice_secs(seg.start_sec, seg.end_sec),
            )
        })
        .collect()
}

fn error_kind(e: &ScribaError) -> &'static str {
    match e {
        ScribaError::Input(_) => "input",
        ScribaError::EngineTransient { .. } => "engine_transient",
        ScribaError::EngineUnavailable { .. } => "engine_unavailable",
        ScribaError::Checkpoint(_) => "checkpoint",
        ScribaError::MediaTool(_) => "media_tool",
        ScribaError::Protocol(_) => "protocol",
        ScribaError::Canceled => "canceled",
        ScribaError::JobNotFound(_) => "not_found",
        ScribaError::InvalidTransition(_) => "invalid_transition",
        ScribaError::Io(_) => "io",
        ScribaError::Other(_) => "other",
    }
}
