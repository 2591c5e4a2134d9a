//! Typed event payloads for the per-job bus.
//!
//! Tags are a closed sum — subscribers dispatch on the variant, never on
//! strings. The dotted tag partitions are `progress.*`, `subtitle.*` and
//! `signal.*`; the wire shape is one SSE message per event with `id:`
//! (sequence), `event:` (tag) and `data:` (JSON body carrying `job_id`).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::job::Phase;
use crate::subtitle::{Sentence, WordTimestamp};

/// Snapshot of a sentence as carried in `subtitle.*` event bodies.
#[derive(Debug, Clone, Serialize)]
pub struct SentenceView {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: f32,
    pub source: crate::subtitle::SentenceSource,
    pub words: Vec<WordTimestamp>,
}

impl From<&Sentence> for SentenceView {
    fn from(s: &Sentence) -> Self {
        Self {
            start: s.start,
            end: s.end,
            text: s.text.clone(),
            confidence: s.confidence,
            source: s.source,
            words: s.words.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    JobStart,
    JobComplete,
    JobFailed,
    JobCanceled,
    PhaseStart,
    PhaseComplete,
    ReplayGap,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::JobStart => "job_start",
            Signal::JobComplete => "job_complete",
            Signal::JobFailed => "job_failed",
            Signal::JobCanceled => "job_canceled",
            Signal::PhaseStart => "phase_start",
            Signal::PhaseComplete => "phase_complete",
            Signal::ReplayGap => "replay_gap",
        }
    }
}

/// Every event the pipeline can publish.
#[derive(Debug, Clone)]
pub enum EventPayload {
    ProgressOverall {
        phase: Phase,
        percent: f64,
        message: String,
    },
    ProgressPhase {
        phase: Phase,
        items_done: usize,
        items_total: usize,
        message: String,
    },
    PrimarySentence {
        index: usize,
        sentence: SentenceView,
    },
    SecondaryPatch {
        index: usize,
        sentence: SentenceView,
    },
    LlmProof {
        index: usize,
        sentence: SentenceView,
        perplexity: f64,
    },
    LlmTrans {
        index: usize,
        translation: String,
        confidence: f32,
    },
    Signal {
        signal: Signal,
        message: Option<String>,
    },
}

impl EventPayload {
    /// The SSE `event:` name.
    pub fn tag(&self) -> String {
        match self {
            EventPayload::ProgressOverall { .. } => "progress.overall".into(),
            EventPayload::ProgressPhase { phase, .. } => format!("progress.{}", phase.as_str()),
            EventPayload::PrimarySentence { .. } => "subtitle.primary_sentence".into(),
            EventPayload::SecondaryPatch { .. } => "subtitle.secondary_patch".into(),
            EventPayload::LlmProof { .. } => "subtitle.llm_proof".into(),
            EventPayload::LlmTrans { .. } => "subtitle.llm_trans".into(),
            EventPayload::Signal { signal, .. } => format!("signal.{}", signal.as_str()),
        }
    }

    /// True for events multiplexed onto the global (cross-job) lane.
    pub fn on_global_lane(&self) -> bool {
        matches!(
            self,
            EventPayload::Signal { .. } | EventPayload::ProgressOverall { .. }
        )
    }

    fn body(&self) -> Value {
        match self {
            EventPayload::ProgressOverall {
                phase,
                percent,
                message,
            } => json!({ "phase": phase.as_str(), "percent": percent, "message": message }),
            EventPayload::ProgressPhase {
                phase,
                items_done,
                items_total,
                message,
            } => json!({
                "phase": phase.as_str(),
                "items_done": items_done,
                "items_total": items_total,
                "message": message,
            }),
            EventPayload::PrimarySentence { index, sentence } => {
                json!({ "index": index, "sentence": sentence })
            }
            EventPayload::SecondaryPatch { index, sentence } => {
                json!({ "index": index, "sentence": sentence, "is_update": true })
            }
            EventPayload::LlmProof {
                index,
                sentence,
                perplexity,
            } => json!({ "index": index, "sentence": sentence, "perplexity": perplexity }),
            EventPayload::LlmTrans {
                index,
                translation,
                confidence,
            } => json!({ "index": index, "translation": translation, "confidence": confidence }),
            EventPayload::Signal { signal, message } => {
                let mut body = json!({ "signal": signal.as_str() });
                if let Some(m) = message {
                    body["message"] = Value::String(m.clone());
                }
                body
            }
        }
    }
}

/// A published event: per-job monotonic sequence id plus the payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Envelope {
    /// The SSE `data:` body — the payload body with `job_id` merged in.
    pub fn body(&self) -> Value {
        let mut body = self.payload.body();
        body["job_id"] = Value::String(self.job_id.clone());
        body
    }
}
