//! End-to-end pipeline scenarios with scripted engines.
//!
//! Each test pre-writes the extracted `audio.wav` artifact into the job
//! directory so no external media tooling is needed; the runner reuses the
//! artifact and the (deterministic) engine stubs drive every path: plain
//! transcription, fuse upgrades, cancellation and checkpoint resume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use scriba_core::audio::AudioBuffer;
use scriba_core::bus::EventBus;
use scriba_core::checkpoint::CheckpointStore;
use scriba_core::chunk::SeparationTier;
use scriba_core::engines::stub::{ScriptedPrimaryAsr, ScriptedVad, StubLlm, StubSecondaryAsr};
use scriba_core::engines::{
    AsrWord, EngineProvider, LlmEngine, PrimaryAsrEngine, PrimaryTranscription,
    SecondaryAsrEngine, SeparatorEngine, VadEngine,
};
use scriba_core::error::Result;
use scriba_core::events::EventPayload;
use scriba_core::hardware::HardwareProfile;
use scriba_core::job::{JobManifest, JobStatus, Preset};
use scriba_core::media;
use scriba_core::models::ModelManager;
use scriba_core::pipeline::{self, JobControl, RunOutcome, RunnerContext};
use scriba_core::queue::JobStore;
use scriba_core::spectrum::SpectrumClassifier;
use scriba_core::subtitle::Sentence;
use scriba_core::{srt, JobRecord};

// ---------------------------------------------------------------------------
// Test provider
// ---------------------------------------------------------------------------

struct CountingSeparator {
    tier: SeparationTier,
    tiers_used: Arc<Mutex<Vec<SeparationTier>>>,
}

impl SeparatorEngine for CountingSeparator {
    fn tier(&self) -> SeparationTier {
        self.tier
    }

    fn separate(&mut self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        self.tiers_used.lock().push(self.tier);
        Ok(audio.clone())
    }
}

/// Primary ASR that pops a shared script and notifies a hook per call.
struct HookedPrimaryAsr {
    inner: ScriptedPrimaryAsr,
    calls: Arc<AtomicUsize>,
    on_call: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl PrimaryAsrEngine for HookedPrimaryAsr {
    fn transcribe(
        &mut self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> Result<PrimaryTranscription> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        self.inner.transcribe(audio, language_hint)
    }
}

#[derive(Clone)]
struct TestProvider {
    vad_spans: Vec<(f64, f64)>,
    script: Arc<Mutex<VecDeque<PrimaryTranscription>>>,
    asr_calls: Arc<AtomicUsize>,
    separator_tiers: Arc<Mutex<Vec<SeparationTier>>>,
    on_transcribe: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl TestProvider {
    fn new(vad_spans: Vec<(f64, f64)>, script: Vec<PrimaryTranscription>) -> Self {
        Self {
            vad_spans,
            script: Arc::new(Mutex::new(script.into())),
            asr_calls: Arc::new(AtomicUsize::new(0)),
            separator_tiers: Arc::new(Mutex::new(Vec::new())),
            on_transcribe: None,
        }
    }
}

impl EngineProvider for TestProvider {
    fn load_vad(&self) -> Result<Box<dyn VadEngine>> {
        Ok(Box::new(ScriptedVad::new(&self.vad_spans)))
    }

    fn load_separator(&self, tier: SeparationTier) -> Result<Box<dyn SeparatorEngine>> {
        Ok(Box::new(CountingSeparator {
            tier,
            tiers_used: Arc::clone(&self.separator_tiers),
        }))
    }

    fn load_primary_asr(&self) -> Result<Box<dyn PrimaryAsrEngine>> {
        Ok(Box::new(HookedPrimaryAsr {
            inner: ScriptedPrimaryAsr::from_shared(Arc::clone(&self.script)),
            calls: Arc::clone(&self.asr_calls),
            on_call: self.on_transcribe.clone(),
        }))
    }

    fn load_secondary_asr(&self) -> Result<Box<dyn SecondaryAsrEngine>> {
        Ok(Box::new(StubSecondaryAsr))
    }

    fn load_llm(&self) -> Result<Box<dyn LlmEngine>> {
        Ok(Box::new(StubLlm))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    provider: TestProvider,
    control: JobControl,
    manifest: JobManifest,
}

fn sine(freq: f32, secs: f32, rate: u32) -> Vec<f32> {
    let n = (secs * rate as f32) as usize;
    (0..n)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
        .collect()
}

/// Deterministic tone+noise mix that the classifier reads as CLEAN.
fn clean_audio(secs: f32) -> Vec<f32> {
    let rate = 16_000u32;
    let n = (secs * rate as f32) as usize;
    let mut state = 0x2545F4914F6CDD1Du64;
    (0..n)
        .map(|i| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let noise = (((state >> 33) as f64 / (1u64 << 31) as f64) as f32 - 1.0) * 0.4;
            let tone = 0.4 * (2.0 * std::f32::consts::PI * 200.0 * i as f32 / rate as f32).sin();
            tone + noise
        })
        .collect()
}

fn word(text: &str, start: f64, end: f64, confidence: f32) -> AsrWord {
    AsrWord {
        text: text.into(),
        start,
        end,
        confidence,
    }
}

fn transcription(words: Vec<AsrWord>, event_tag: Option<&str>) -> PrimaryTranscription {
    let text = words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let avg = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };
    PrimaryTranscription {
        text_clean: text.clone(),
        text,
        avg_confidence: avg,
        words,
        event_tag: event_tag.map(str::to_owned),
        language: None,
    }
}

impl Harness {
    fn new(samples: Vec<f32>, provider: TestProvider, preset: Preset) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(CheckpointStore::new(dir.path().join("jobs")).unwrap());
        let job_id = "job-test".to_string();
        checkpoints.create_job_dir(&job_id).unwrap();
        media::write_wav(
            &checkpoints.audio_path(&job_id),
            &AudioBuffer::new(samples, 16_000),
        )
        .unwrap();

        let mut manifest = JobManifest::new(
            job_id.clone(),
            "scenario".into(),
            checkpoints.input_path(&job_id, "mp4"),
            "input.mp4".into(),
        );
        manifest.settings.preset = preset;
        manifest.status = JobStatus::Processing;
        // Pre-probed so the runner never shells out to ffprobe.
        manifest.duration_secs = Some(10.0);

        let store = Arc::new(JobStore::new());
        store.insert(JobRecord::new(manifest.clone()));

        Self {
            _dir: dir,
            checkpoints,
            store,
            bus: Arc::new(EventBus::new()),
            provider,
            control: JobControl::new(),
            manifest,
        }
    }

    fn run(&self) -> RunOutcome {
        self.run_with_restore(Vec::new())
    }

    fn run_with_restore(&self, restored: Vec<Sentence>) -> RunOutcome {
        let profile = HardwareProfile {
            has_accelerator: true,
            accelerator_name: Some("test".into()),
            accelerator_memory_mb: 16_384,
            cpu_cores: 8,
        };
        let models = Arc::new(ModelManager::new(Arc::new(self.provider.clone()), false));
        let ctx = RunnerContext {
            manifest: self.manifest.clone(),
            models,
            bus: Arc::clone(&self.bus),
            checkpoints: Arc::clone(&self.checkpoints),
            store: Arc::clone(&self.store),
            policy: profile.policy(),
            classifier: SpectrumClassifier::default(),
            control: self.control.clone(),
            restored_sentences: restored,
        };
        pipeline::run(ctx)
    }

    fn event_tags(&self) -> Vec<String> {
        self.bus
            .subscribe(&self.manifest.job_id, Some(0))
            .replay
            .iter()
            .map(|e| e.payload.tag())
            .collect()
    }

    fn count_tag(&self, tag: &str) -> usize {
        self.event_tags().iter().filter(|t| *t == tag).count()
    }

    fn srt_text(&self) -> String {
        std::fs::read_to_string(self.checkpoints.srt_path(&self.manifest.job_id)).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Seed 1: tone input, one VAD chunk, MUSIC verdict → heavy pre-separation,
/// one sentence, canonical event set and SRT bytes.
#[test]
fn music_chunk_pre_separates_and_emits_single_sentence() {
    let script = vec![transcription(
        vec![word("你好", 0.0, 4.8, 0.9), word("世界", 4.8, 10.0, 0.9)],
        None,
    )];
    let provider = TestProvider::new(vec![(0.0, 10.0)], script);
    let h = Harness::new(sine(440.0, 10.0, 16_000), provider.clone(), Preset::Default);

    assert_eq!(h.run(), RunOutcome::Finished);

    // Heavy separation ran exactly once, on the original audio.
    assert_eq!(&*provider.separator_tiers.lock(), &[SeparationTier::Heavy]);
    assert_eq!(provider.asr_calls.load(Ordering::SeqCst), 1);

    let tags = h.event_tags();
    for expected in [
        "progress.extract",
        "progress.vad",
        "progress.bgm_detect",
        "progress.demucs",
        "progress.primary_asr",
        "subtitle.primary_sentence",
        "signal.job_complete",
    ] {
        assert!(tags.iter().any(|t| t == expected), "missing {expected} in {tags:?}");
    }
    assert_eq!(h.count_tag("subtitle.primary_sentence"), 1);

    // Event sequence ids are strictly increasing from 1.
    let seqs: Vec<u64> = h
        .bus
        .subscribe(&h.manifest.job_id, Some(0))
        .replay
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs[0], 1);
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));

    assert_eq!(h.srt_text(), "1\n00:00:00,000 --> 00:00:10,000\n你好 世界\n");

    let record = h.store.get("job-test").unwrap();
    assert_eq!(record.sentences.len(), 1);
    assert_eq!(record.sentences[0].start, 0.0);
    assert_eq!(record.sentences[0].end, 10.0);
}

/// Seed 2: low confidence + BGM tag drives the fuse loop none→light→heavy,
/// then accepts at the retry cap. Three transcriptions, two separations.
#[test]
fn fuse_upgrades_through_both_tiers_then_accepts() {
    let w = |conf| vec![word("测试句子", 0.0, 3.0, conf)];
    let script = vec![
        transcription(w(0.3), Some("BGM")),
        transcription(w(0.4), Some("BGM")),
        transcription(w(0.4), Some("BGM")),
    ];
    let provider = TestProvider::new(vec![(0.0, 3.0)], script);
    // Clean mix: the diagnosis stage must not pre-separate, so both
    // separations below belong to the fuse loop.
    let h = Harness::new(clean_audio(3.0), provider.clone(), Preset::Default);

    assert_eq!(h.run(), RunOutcome::Finished);

    assert_eq!(provider.asr_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        &*provider.separator_tiers.lock(),
        &[SeparationTier::Light, SeparationTier::Heavy]
    );

    // Exactly one sentence, carrying the final (accepted) confidence.
    let record = h.store.get("job-test").unwrap();
    assert_eq!(record.sentences.len(), 1);
    assert!((record.sentences[0].confidence - 0.4).abs() < 1e-6);
    assert_eq!(h.count_tag("subtitle.primary_sentence"), 1);
}

/// Seed 3: two clean chunks, preset1, both confident → no secondary patch.
#[test]
fn confident_sentences_skip_secondary_patch() {
    let script = vec![
        transcription(vec![word("第一句话", 0.0, 3.0, 0.9)], None),
        transcription(vec![word("第二句话", 0.0, 3.0, 0.9)], None),
    ];
    let provider = TestProvider::new(vec![(0.0, 3.0), (3.0, 6.0)], script);
    let h = Harness::new(clean_audio(6.0), provider.clone(), Preset::Preset1);

    assert_eq!(h.run(), RunOutcome::Finished);

    // No pre-separation on clean audio and no fuse upgrades.
    assert!(provider.separator_tiers.lock().is_empty());
    assert_eq!(h.count_tag("subtitle.primary_sentence"), 2);
    assert_eq!(h.count_tag("subtitle.secondary_patch"), 0);

    // Sentence order follows chunk order.
    let record = h.store.get("job-test").unwrap();
    assert_eq!(record.sentences.len(), 2);
    assert!(record.sentences[0].chunk_index < record.sentences[1].chunk_index);
    assert_eq!(record.manifest.status, JobStatus::Processing); // scheduler owns final status
    assert_eq!(record.manifest.completed_chunks, 2);
}

/// Preset1 with a low-confidence sentence: the secondary pass rewrites the
/// text, preserves the interval and pseudo-aligns the words.
#[test]
fn low_confidence_sentence_gets_patched() {
    let script = vec![transcription(vec![word("模糊不清", 0.0, 4.0, 0.3)], None)];
    let provider = TestProvider::new(vec![(0.0, 4.0)], script);
    let h = Harness::new(clean_audio(4.0), provider, Preset::Preset1);

    assert_eq!(h.run(), RunOutcome::Finished);
    assert_eq!(h.count_tag("subtitle.secondary_patch"), 1);

    let record = h.store.get("job-test").unwrap();
    let s = &record.sentences[0];
    assert_eq!(s.start, 0.0);
    assert_eq!(s.end, 4.0);
    assert!(s.is_modified);
    assert_eq!(s.original_text.as_deref(), Some("模糊不清"));
    assert!(s.words.iter().all(|w| w.is_pseudo));
    let covered: f64 = s.words.iter().map(|w| w.end - w.start).sum();
    assert!((covered - 4.0).abs() < 1e-6);
}

/// Seed 4: cancel lands during chunk 1 of 3 — the in-flight chunk commits,
/// the runner exits at the next boundary, later chunks never run.
#[test]
fn cancel_mid_transcription_retains_committed_sentences() {
    let script = vec![
        transcription(vec![word("第一句话", 0.0, 3.0, 0.9)], None),
        transcription(vec![word("第二句话", 0.0, 3.0, 0.9)], None),
        transcription(vec![word("第三句话", 0.0, 3.0, 0.9)], None),
    ];
    let mut provider = TestProvider::new(vec![(0.0, 3.0), (3.0, 6.0), (6.0, 9.0)], script);
    let h = Harness::new(clean_audio(9.0), provider.clone(), Preset::Default);

    // Cancel fires while the first chunk's model call is in flight.
    let control = h.control.clone();
    provider.on_transcribe = Some(Arc::new(move |_n| control.request_cancel()));
    let h = Harness {
        provider: provider.clone(),
        ..h
    };

    assert_eq!(h.run(), RunOutcome::Canceled);

    assert_eq!(provider.asr_calls.load(Ordering::SeqCst), 1);
    let record = h.store.get("job-test").unwrap();
    assert_eq!(record.sentences.len(), 1);
    assert_eq!(h.count_tag("signal.job_canceled"), 1);
    assert_eq!(h.count_tag("signal.job_complete"), 0);
}

/// Seed 5: restart after one committed sentence — the runner resumes at
/// chunk 2 and the final SRT holds all three sentences exactly once.
#[test]
fn resume_continues_from_first_untranscribed_chunk() {
    let script = vec![
        transcription(vec![word("第二句话", 0.0, 3.0, 0.9)], None),
        transcription(vec![word("第三句话", 0.0, 3.0, 0.9)], None),
    ];
    let provider = TestProvider::new(vec![(0.0, 3.0), (3.0, 6.0), (6.0, 9.0)], script);
    let mut h = Harness::new(clean_audio(9.0), provider.clone(), Preset::Default);
    h.manifest.completed_chunks = 1;

    let restored = vec![Sentence::new(0, 0, 0.0, 3.0, "第一句话".into(), 0.9, vec![])];
    assert_eq!(h.run_with_restore(restored), RunOutcome::Finished);

    // Only the two remaining chunks were transcribed.
    assert_eq!(provider.asr_calls.load(Ordering::SeqCst), 2);

    let entries = srt::parse(&h.srt_text()).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].text, "第一句话");
    assert_eq!(entries[1].text, "第二句话");
    assert_eq!(entries[2].text, "第三句话");
}

/// Empty VAD output: the job still finishes, with an empty SRT and no
/// subtitle events.
#[test]
fn no_speech_finishes_with_empty_subtitle() {
    let provider = TestProvider::new(vec![], vec![]);
    let h = Harness::new(clean_audio(3.0), provider.clone(), Preset::Default);

    assert_eq!(h.run(), RunOutcome::Finished);
    assert_eq!(provider.asr_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.srt_text(), "");
    assert_eq!(h.count_tag("subtitle.primary_sentence"), 0);
    assert_eq!(h.count_tag("signal.job_complete"), 1);

    // Overall progress still reached 100.
    let percents: Vec<f64> = h
        .bus
        .subscribe(&h.manifest.job_id, Some(0))
        .replay
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ProgressOverall { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(percents.last().copied(), Some(100.0));
}

/// A fresh subscriber replaying from Last-Event-ID=0 can rebuild the final
/// transcript from `subtitle.*` events alone.
#[test]
fn event_replay_reconstructs_final_transcript() {
    let script = vec![
        transcription(vec![word("清楚的句子", 0.0, 3.0, 0.9)], None),
        transcription(vec![word("模糊的句子", 0.0, 3.0, 0.3)], None),
    ];
    let provider = TestProvider::new(vec![(0.0, 3.0), (3.0, 6.0)], script);
    let h = Harness::new(clean_audio(6.0), provider, Preset::Preset1);
    assert_eq!(h.run(), RunOutcome::Finished);

    let mut rebuilt: Vec<(f64, f64, String)> = Vec::new();
    for env in h.bus.subscribe("job-test", Some(0)).replay {
        match env.payload {
            EventPayload::PrimarySentence { index, sentence } => {
                assert_eq!(index, rebuilt.len());
                rebuilt.push((sentence.start, sentence.end, sentence.text));
            }
            EventPayload::SecondaryPatch { index, sentence }
            | EventPayload::LlmProof { index, sentence, .. } => {
                rebuilt[index] = (sentence.start, sentence.end, sentence.text);
            }
            _ => {}
        }
    }

    let authoritative = h.store.get("job-test").unwrap().sentences;
    assert_eq!(rebuilt.len(), authoritative.len());
    for (r, s) in rebuilt.iter().zip(&authoritative) {
        assert_eq!(r.0, s.start);
        assert_eq!(r.1, s.end);
        assert_eq!(r.2, s.text);
    }
    // The low-confidence sentence was the one that got patched.
    assert!(authoritative[1].is_modified);
    assert!(!authoritative[0].is_modified);
}

/// Preset4 runs proof and translation over every sentence.
#[test]
fn full_preset_proofs_and_translates() {
    let script = vec![transcription(vec![word("你好世界", 0.0, 3.0, 0.9)], None)];
    let provider = TestProvider::new(vec![(0.0, 3.0)], script);
    let mut h = Harness::new(clean_audio(3.0), provider, Preset::Preset4);
    h.manifest.settings.preset = Preset::Preset4;
    h.manifest.settings.target_language = Some("en".into());

    assert_eq!(h.run(), RunOutcome::Finished);
    assert_eq!(h.count_tag("subtitle.llm_proof"), 1);
    assert_eq!(h.count_tag("subtitle.llm_trans"), 1);

    let record = h.store.get("job-test").unwrap();
    let s = &record.sentences[0];
    assert!(s.translation.as_deref().unwrap().starts_with("[en]"));
    assert!(s.perplexity.is_some());
    // Proof preserved the committed interval.
    assert_eq!(s.start, 0.0);
    assert_eq!(s.end, 3.0);
}
