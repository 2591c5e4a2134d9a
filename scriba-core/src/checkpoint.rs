//! Checkpoint store — per-job directory with an atomic `manifest.json`
//! plus the committed sentence list in `segments.json`.
//!
//! Layout per job:
//! `jobs/<job_id>/{manifest.json, input.<ext>, audio.wav, peaks.json,
//! thumbnails/*.jpg, segments.json, output.srt}`. Everything except the
//! manifest and input is regenerable.
//!
//! Writes serialize to a sibling temp file and rename, so readers always
//! see a complete manifest. Checkpoint IO failures are non-fatal to the
//! pipeline: callers log and continue, bounding state loss to the current
//! phase.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Result, ScribaError};
use crate::job::{JobManifest, JobRecord, JobStatus};
use crate::subtitle::Sentence;

pub struct CheckpointStore {
    jobs_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id)
    }

    pub fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("manifest.json")
    }

    pub fn segments_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("segments.json")
    }

    pub fn audio_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("audio.wav")
    }

    pub fn peaks_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("peaks.json")
    }

    pub fn srt_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("output.srt")
    }

    pub fn thumbnails_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("thumbnails")
    }

    pub fn proxy_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("proxy.mp4")
    }

    pub fn input_path(&self, job_id: &str, ext: &str) -> PathBuf {
        let name = if ext.is_empty() {
            "input".to_string()
        } else {
            format!("input.{ext}")
        };
        self.job_dir(job_id).join(name)
    }

    pub fn create_job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| ScribaError::Checkpoint(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)
            .map_err(|e| ScribaError::Checkpoint(format!("mkdir {}: {e}", parent.display())))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .map_err(|e| ScribaError::Checkpoint(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| ScribaError::Checkpoint(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn save_manifest(&self, manifest: &JobManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| ScribaError::Checkpoint(format!("serialize manifest: {e}")))?;
        self.write_atomic(&self.manifest_path(&manifest.job_id), &json)
    }

    pub fn save_sentences(&self, job_id: &str, sentences: &[Sentence]) -> Result<()> {
        let json = serde_json::to_vec_pretty(sentences)
            .map_err(|e| ScribaError::Checkpoint(format!("serialize sentences: {e}")))?;
        self.write_atomic(&self.segments_path(job_id), &json)
    }

    pub fn load_manifest(&self, job_id: &str) -> Result<JobManifest> {
        let raw = fs::read_to_string(self.manifest_path(job_id))
            .map_err(|e| ScribaError::Checkpoint(format!("read manifest {job_id}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| ScribaError::Checkpoint(format!("parse manifest {job_id}: {e}")))
    }

    /// Missing `segments.json` simply means no sentences were committed.
    pub fn load_sentences(&self, job_id: &str) -> Vec<Sentence> {
        let path = self.segments_path(job_id);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(job_id, error = %e, "unparseable segments.json — ignoring");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// Startup scan: load every job directory with a readable manifest.
    /// Jobs that were PROCESSING at crash time re-enter as QUEUED; PAUSED
    /// and terminal states are preserved.
    pub fn scan(&self) -> Vec<JobRecord> {
        let mut records = Vec::new();
        let Ok(entries) = fs::read_dir(&self.jobs_dir) else {
            return records;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let job_id = entry.file_name().to_string_lossy().to_string();
            let mut manifest = match self.load_manifest(&job_id) {
                Ok(m) => m,
                Err(e) => {
                    warn!(job_id, error = %e, "skipping job with unreadable manifest");
                    continue;
                }
            };
            if manifest.status == JobStatus::Processing {
                info!(job_id, "job was processing at shutdown — restoring to queued");
                manifest.status = JobStatus::Queued;
                if let Err(e) = self.save_manifest(&manifest) {
                    warn!(job_id, error = %e, "could not persist restored status");
                }
            }
            let sentences = self.load_sentences(&job_id);
            records.push(JobRecord {
                manifest,
                sentences,
            });
        }
        records.sort_by(|a, b| a.manifest.created_at.cmp(&b.manifest.created_at));
        records
    }

    /// Remove a job's directory entirely (cancel with purge).
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| ScribaError::Checkpoint(format!("purge {job_id}: {e}")))?;
        }
        Ok(())
    }
}
