//! # scriba-core
//!
//! Video-to-subtitle pipeline engine.
//!
//! ## Architecture
//!
//! ```text
//! input file → Scheduler (queue, single active job)
//!                  │ spawn_blocking
//!            Pipeline runner
//!   extract → VAD → diagnose → separate (selective)
//!          → per-chunk: ASR → fuse? → (re-separate + retry)
//!          → SubtitleSession commit → post-enhance → SRT
//!                  │
//!            EventBus (per-job ring + broadcast, SSE fan-out)
//!            CheckpointStore (atomic manifest, resume)
//! ```
//!
//! Heavy engines (VAD, separator, ASR, LLM) live behind the adapter traits
//! in [`engines`] and are loaded/evicted through the [`models`] manager so
//! at most one heavy model occupies the accelerator at a time.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod bus;
pub mod checkpoint;
pub mod chunk;
pub mod engines;
pub mod error;
pub mod events;
pub mod fuse;
pub mod hardware;
pub mod job;
pub mod media;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod session;
pub mod spectrum;
pub mod srt;
pub mod subtitle;

// Convenience re-exports for downstream crates
pub use bus::EventBus;
pub use checkpoint::CheckpointStore;
pub use error::{Result, ScribaError};
pub use job::{JobManifest, JobRecord, JobSettings, JobStatus, Phase, Preset};
pub use models::ModelManager;
pub use queue::{JobStore, Scheduler};
