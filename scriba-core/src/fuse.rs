//! Fuse controller — decides whether a chunk's transcription is accepted or
//! the chunk goes back through a stronger separator first.
//!
//! Pure decision function; the runner owns the side effects (evict ASR,
//! run separation, re-transcribe).

use crate::chunk::{ChunkState, SeparationTier};

/// Ambient-audio labels that justify re-separating. Anything else means the
/// low confidence is a text problem, handled later by post-processing.
const AMBIENT_TAGS: &[&str] = &["BGM", "Music", "Noise", "Applause"];

/// Default confidence at or above which a transcription is accepted as-is.
pub const DEFAULT_FUSE_CONFIDENCE: f32 = 0.5;

/// Outcome of the fuse decision. `Accept` is terminal for the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseDecision {
    Accept,
    UpgradeSeparation { tier: SeparationTier },
}

/// Rules, in order:
/// 1. confident enough → accept;
/// 2. no ambient-audio tag → accept (re-separating will not help);
/// 3. no upgrade budget left → accept (stop-loss);
/// 4. otherwise upgrade to the next tier.
pub fn decide(
    chunk: &ChunkState,
    confidence: f32,
    event_tag: Option<&str>,
    confidence_threshold: f32,
) -> FuseDecision {
    if confidence >= confidence_threshold {
        return FuseDecision::Accept;
    }
    let ambient = event_tag
        .map(|tag| AMBIENT_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t)))
        .unwrap_or(false);
    if !ambient {
        return FuseDecision::Accept;
    }
    if !chunk.can_upgrade() {
        return FuseDecision::Accept;
    }
    match chunk.next_tier() {
        Some(tier) => FuseDecision::UpgradeSeparation { tier },
        None => FuseDecision::Accept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioBuffer;
    use crate::chunk::ChunkState;

    fn chunk() -> ChunkState {
        ChunkState::new(0, 0.0, 3.0, AudioBuffer::new(vec![0.1; 48_000], 16_000))
    }

    #[test]
    fn high_confidence_accepts() {
        let c = chunk();
        assert_eq!(
            decide(&c, 0.9, Some("BGM"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::Accept
        );
    }

    #[test]
    fn low_confidence_without_ambient_tag_accepts() {
        let c = chunk();
        assert_eq!(decide(&c, 0.1, None, DEFAULT_FUSE_CONFIDENCE), FuseDecision::Accept);
        assert_eq!(
            decide(&c, 0.1, Some("Laughter"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::Accept
        );
    }

    #[test]
    fn ambient_and_low_confidence_upgrade_through_tiers() {
        let mut c = chunk();

        // First pass: none → light.
        assert_eq!(
            decide(&c, 0.3, Some("BGM"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::UpgradeSeparation {
                tier: SeparationTier::Light
            }
        );
        c.apply_separation(SeparationTier::Light, AudioBuffer::new(vec![0.0; 48_000], 16_000));
        c.record_fuse_retry();

        // Second pass: light → heavy.
        assert_eq!(
            decide(&c, 0.4, Some("BGM"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::UpgradeSeparation {
                tier: SeparationTier::Heavy
            }
        );
        c.apply_separation(SeparationTier::Heavy, AudioBuffer::new(vec![0.0; 48_000], 16_000));
        c.record_fuse_retry();

        // Third pass: cap reached, accept regardless.
        assert_eq!(
            decide(&c, 0.4, Some("BGM"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::Accept
        );
        assert_eq!(c.fuse_retry_count, 1);
    }

    #[test]
    fn tag_matching_is_case_insensitive() {
        let c = chunk();
        assert_eq!(
            decide(&c, 0.2, Some("bgm"), DEFAULT_FUSE_CONFIDENCE),
            FuseDecision::UpgradeSeparation {
                tier: SeparationTier::Light
            }
        );
    }
}
