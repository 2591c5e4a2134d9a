//! Per-VAD-chunk state threaded through the separate/transcribe/fuse loop.
//!
//! The one invariant that matters here: `original_audio` is written exactly
//! once, at construction, and every separation pass reads from it and writes
//! `current_audio`. `ChunkAudio` enforces that by construction — the original
//! is a private field with a read-only accessor.

use serde::{Deserialize, Serialize};

use crate::audio::AudioBuffer;

/// How aggressively a chunk has been source-separated. Only ever moves
/// forward: none → light → heavy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparationLevel {
    None,
    Light,
    Heavy,
}

/// Separator model tier. Distinct from [`SeparationLevel`]: a level of
/// `None` has no corresponding tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparationTier {
    Light,
    Heavy,
}

impl SeparationTier {
    pub fn as_level(self) -> SeparationLevel {
        match self {
            SeparationTier::Light => SeparationLevel::Light,
            SeparationTier::Heavy => SeparationLevel::Heavy,
        }
    }
}

/// Pre-separation audio (immutable after construction) plus the working copy
/// the ASR actually consumes.
#[derive(Debug, Clone)]
pub struct ChunkAudio {
    original: AudioBuffer,
    current: AudioBuffer,
}

impl ChunkAudio {
    pub fn new(original: AudioBuffer) -> Self {
        let current = original.clone();
        Self { original, current }
    }

    /// The pre-separation samples. Read-only — separation always restarts
    /// from here rather than compounding passes.
    pub fn original(&self) -> &AudioBuffer {
        &self.original
    }

    pub fn current(&self) -> &AudioBuffer {
        &self.current
    }

    /// Replace the working copy after a separation pass.
    pub fn replace_current(&mut self, separated: AudioBuffer) {
        self.current = separated;
    }
}

/// Maximum fuse retries per chunk.
const FUSE_RETRY_CAP: u32 = 1;

/// In-memory state for one VAD chunk. Private to the runner; nothing else
/// mutates these.
#[derive(Debug)]
pub struct ChunkState {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub audio: ChunkAudio,
    pub separation_level: SeparationLevel,
    pub fuse_retry_count: u32,
}

impl ChunkState {
    pub fn new(index: usize, start: f64, end: f64, audio: AudioBuffer) -> Self {
        Self {
            index,
            start,
            end,
            audio: ChunkAudio::new(audio),
            separation_level: SeparationLevel::None,
            fuse_retry_count: 0,
        }
    }

    /// Whether the fuse controller may order another separation upgrade.
    ///
    /// The heavy tier is the hard stop: a chunk re-transcribes at most once
    /// per remaining tier step, so the loop is bounded by construction. The
    /// retry counter saturates at [`FUSE_RETRY_CAP`] for observability.
    pub fn can_upgrade(&self) -> bool {
        self.separation_level < SeparationLevel::Heavy
    }

    /// The tier the next upgrade would use. `None` when already at heavy.
    pub fn next_tier(&self) -> Option<SeparationTier> {
        match self.separation_level {
            SeparationLevel::None => Some(SeparationTier::Light),
            SeparationLevel::Light => Some(SeparationTier::Heavy),
            SeparationLevel::Heavy => None,
        }
    }

    /// Record a completed separation pass at `tier`. Levels only move
    /// forward; a lower tier than the current level is a logic error upstream
    /// and is ignored.
    pub fn apply_separation(&mut self, tier: SeparationTier, separated: AudioBuffer) {
        let level = tier.as_level();
        if level > self.separation_level {
            self.separation_level = level;
        }
        self.audio.replace_current(separated);
    }

    pub fn record_fuse_retry(&mut self) {
        self.fuse_retry_count = (self.fuse_retry_count + 1).min(FUSE_RETRY_CAP);
    }
}
