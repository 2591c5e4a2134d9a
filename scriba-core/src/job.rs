//! Job aggregate: lifecycle status, pipeline phases, presets and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::split::SplitConfig;
use crate::subtitle::Sentence;

/// Job lifecycle states. Terminal: Finished, Failed, Canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Queued,
    Processing,
    Paused,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled)
    }
}

/// Pipeline phases in runtime order. Progress weights are keyed by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Vad,
    BgmDetect,
    Demucs,
    PrimaryAsr,
    SecondaryPatch,
    LlmProof,
    LlmTrans,
    Srt,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Extract,
        Phase::Vad,
        Phase::BgmDetect,
        Phase::Demucs,
        Phase::PrimaryAsr,
        Phase::SecondaryPatch,
        Phase::LlmProof,
        Phase::LlmTrans,
        Phase::Srt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Vad => "vad",
            Phase::BgmDetect => "bgm_detect",
            Phase::Demucs => "demucs",
            Phase::PrimaryAsr => "primary_asr",
            Phase::SecondaryPatch => "secondary_patch",
            Phase::LlmProof => "llm_proof",
            Phase::LlmTrans => "llm_trans",
            Phase::Srt => "srt",
        }
    }
}

/// Whether / how much of an enhancement stage a preset runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Off,
    /// Only sentences below the patch threshold (secondary) or carrying a
    /// warning (proof) or with reliable text (translate).
    Partial,
    Full,
}

impl StageMode {
    pub fn enabled(self) -> bool {
        self != StageMode::Off
    }
}

/// Enhancement stages a preset turns on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StagePlan {
    pub secondary_patch: StageMode,
    pub llm_proof: StageMode,
    pub llm_trans: StageMode,
}

/// Named configuration bundle. Fixes the stage plan and progress weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Default,
    Preset1,
    Preset2,
    Preset3,
    Preset4,
    Preset5,
}

impl Default for Preset {
    fn default() -> Self {
        Preset::Default
    }
}

impl Preset {
    pub fn stages(self) -> StagePlan {
        use StageMode::*;
        match self {
            Preset::Default => StagePlan {
                secondary_patch: Off,
                llm_proof: Off,
                llm_trans: Off,
            },
            Preset::Preset1 => StagePlan {
                secondary_patch: Partial,
                llm_proof: Off,
                llm_trans: Off,
            },
            Preset::Preset2 => StagePlan {
                secondary_patch: Full,
                llm_proof: Partial,
                llm_trans: Off,
            },
            Preset::Preset3 => StagePlan {
                secondary_patch: Full,
                llm_proof: Full,
                llm_trans: Off,
            },
            Preset::Preset4 => StagePlan {
                secondary_patch: Full,
                llm_proof: Full,
                llm_trans: Full,
            },
            Preset::Preset5 => StagePlan {
                secondary_patch: Full,
                llm_proof: Full,
                llm_trans: Partial,
            },
        }
    }

    /// Progress weight for each phase. Disabled stages weigh zero and are
    /// excluded from the percent denominator.
    pub fn weight(self, phase: Phase) -> u32 {
        // (extract, bgm_detect, demucs, vad, asr, patch, proof, trans, srt)
        let w: [u32; 9] = match self {
            Preset::Default => [5, 2, 8, 5, 50, 0, 0, 0, 10],
            Preset::Preset1 => [5, 2, 8, 5, 35, 20, 0, 0, 10],
            Preset::Preset2 => [5, 2, 8, 5, 30, 15, 15, 0, 10],
            Preset::Preset3 => [5, 2, 8, 5, 25, 15, 25, 0, 10],
            Preset::Preset4 => [5, 2, 8, 5, 20, 10, 20, 15, 10],
            Preset::Preset5 => [5, 2, 8, 5, 22, 12, 20, 8, 10],
        };
        match phase {
            Phase::Extract => w[0],
            Phase::BgmDetect => w[1],
            Phase::Demucs => w[2],
            Phase::Vad => w[3],
            Phase::PrimaryAsr => w[4],
            Phase::SecondaryPatch => w[5],
            Phase::LlmProof => w[6],
            Phase::LlmTrans => w[7],
            Phase::Srt => w[8],
        }
    }
}

fn default_fuse_confidence() -> f32 {
    crate::fuse::DEFAULT_FUSE_CONFIDENCE
}

fn default_patch_threshold() -> f32 {
    0.6
}

/// User-chosen settings for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub preset: Preset,
    pub language_hint: Option<String>,
    pub target_language: Option<String>,
    #[serde(default = "default_fuse_confidence")]
    pub fuse_confidence_threshold: f32,
    #[serde(default = "default_patch_threshold")]
    pub patch_threshold: f32,
    pub split: SplitConfig,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            preset: Preset::Default,
            language_hint: None,
            target_language: None,
            fuse_confidence_threshold: default_fuse_confidence(),
            patch_threshold: default_patch_threshold(),
            split: SplitConfig::default(),
        }
    }
}

/// Terminal error recorded on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorRecord {
    pub kind: String,
    pub message: String,
}

/// Persistent job state — the checkpoint manifest. Everything else in the
/// job directory is regenerable from this plus `input.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub title: String,
    pub input_path: std::path::PathBuf,
    pub input_filename: String,
    pub settings: JobSettings,
    pub status: JobStatus,
    pub phase: Option<Phase>,
    /// 0–100, non-decreasing while the job runs.
    pub progress: f64,
    pub message: String,
    pub error: Option<JobErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    /// Chunks whose sentences are committed; the runner resumes at this index.
    pub completed_chunks: usize,
    pub last_event_seq: u64,
}

impl JobManifest {
    pub fn new(
        job_id: String,
        title: String,
        input_path: std::path::PathBuf,
        input_filename: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            title,
            input_path,
            input_filename,
            settings: JobSettings::default(),
            status: JobStatus::Created,
            phase: None,
            progress: 0.0,
            message: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
            duration_secs: None,
            completed_chunks: 0,
            last_event_seq: 0,
        }
    }
}

/// In-memory job record: the manifest plus the committed sentence list.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub manifest: JobManifest,
    pub sentences: Vec<Sentence>,
}

impl JobRecord {
    pub fn new(manifest: JobManifest) -> Self {
        Self {
            manifest,
            sentences: Vec::new(),
        }
    }
}
