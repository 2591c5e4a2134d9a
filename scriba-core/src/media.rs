//! Media tooling — ffmpeg/ffprobe invoked as opaque subprocesses, WAV
//! artifact I/O, waveform peaks and thumbnail generation.
//!
//! Everything here is blocking and runs on the runner thread (or a
//! spawn_blocking task for the proxy remux).

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::AudioBuffer;
use crate::error::{Result, ScribaError};

/// Sample rate every pipeline stage operates at.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

fn ffmpeg_bin() -> String {
    std::env::var("SCRIBA_FFMPEG").unwrap_or_else(|_| "ffmpeg".into())
}

fn ffprobe_bin() -> String {
    std::env::var("SCRIBA_FFPROBE").unwrap_or_else(|_| "ffprobe".into())
}

fn run_tool(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    debug!(program, ?args, "running media tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ScribaError::MediaTool(format!("spawn {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScribaError::MediaTool(format!(
            "{program} exited {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Extract mono 16 kHz PCM from any container, persisting the WAV artifact
/// for later media endpoints, and return the decoded samples.
///
/// A failure here means the input is unusable — the job fails with no retry.
pub fn extract_audio(input: &Path, out_wav: &Path) -> Result<AudioBuffer> {
    let input_str = input.to_string_lossy();
    let out_str = out_wav.to_string_lossy();
    run_tool(
        &ffmpeg_bin(),
        &[
            "-y",
            "-i",
            &input_str,
            "-vn",
            "-ac",
            "1",
            "-ar",
            "16000",
            "-f",
            "wav",
            &out_str,
        ],
    )
    .map_err(|e| ScribaError::Input(format!("audio extraction failed: {e}")))?;
    let audio = read_wav(out_wav)?;
    info!(
        secs = format_args!("{:.1}", audio.duration_secs()),
        path = %out_wav.display(),
        "audio extracted"
    );
    Ok(audio)
}

pub fn read_wav(path: &Path) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| ScribaError::Input(format!("open wav {}: {e}", path.display())))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = 1.0 / i16::MAX as f32;
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
    }
    .map_err(|e| ScribaError::Input(format!("decode wav {}: {e}", path.display())))?;
    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

pub fn write_wav(path: &Path, audio: &AudioBuffer) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| ScribaError::MediaTool(format!("create wav: {e}")))?;
    for &s in &audio.samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .map_err(|e| ScribaError::MediaTool(format!("write wav: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| ScribaError::MediaTool(format!("finalize wav: {e}")))
}

/// Container duration in seconds via ffprobe.
pub fn probe_duration(input: &Path) -> Result<f64> {
    let input_str = input.to_string_lossy();
    let out = run_tool(
        &ffprobe_bin(),
        &[
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
            &input_str,
        ],
    )?;
    String::from_utf8_lossy(&out)
        .trim()
        .parse::<f64>()
        .map_err(|e| ScribaError::Input(format!("unparseable duration: {e}")))
}

/// Waveform overview stored beside the audio artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeaksFile {
    pub duration: f64,
    pub peaks: Vec<f32>,
}

/// Downsample to `buckets` peak-amplitude values for the editor waveform.
pub fn compute_peaks(audio: &AudioBuffer, buckets: usize) -> Vec<f32> {
    if audio.is_empty() || buckets == 0 {
        return Vec::new();
    }
    let bucket_len = (audio.samples.len() as f64 / buckets as f64).max(1.0);
    (0..buckets)
        .map(|i| {
            let lo = (i as f64 * bucket_len) as usize;
            let hi = (((i + 1) as f64 * bucket_len) as usize).min(audio.samples.len());
            if lo >= hi {
                return 0.0;
            }
            audio.samples[lo..hi]
                .iter()
                .fold(0.0f32, |acc, s| acc.max(s.abs()))
        })
        .collect()
}

/// Grab `count` evenly spaced frames as JPEG thumbnails.
pub fn generate_thumbnails(
    input: &Path,
    out_dir: &Path,
    count: usize,
    duration: f64,
) -> Result<Vec<(f64, PathBuf)>> {
    std::fs::create_dir_all(out_dir)?;
    let input_str = input.to_string_lossy();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let ts = duration * (i as f64 + 0.5) / count as f64;
        let path = out_dir.join(format!("thumb_{i:03}.jpg"));
        let ts_str = format!("{ts:.3}");
        let path_str = path.to_string_lossy().to_string();
        run_tool(
            &ffmpeg_bin(),
            &[
                "-y", "-ss", &ts_str, "-i", &input_str, "-vframes", "1", "-q:v", "5", &path_str,
            ],
        )?;
        out.push((ts, path));
    }
    Ok(out)
}

/// One-shot remux/transcode to a browser-playable mp4 proxy.
pub fn remux_proxy(input: &Path, out: &Path) -> Result<()> {
    let input_str = input.to_string_lossy();
    let out_str = out.to_string_lossy();
    run_tool(
        &ffmpeg_bin(),
        &[
            "-y",
            "-i",
            &input_str,
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-c:a",
            "aac",
            "-movflags",
            "+faststart",
            &out_str,
        ],
    )?;
    Ok(())
}

/// Container extensions browsers can play without a proxy.
pub fn is_browser_playable(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("mp4") | Some("webm") | Some("mov") | Some("m4v")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_track_bucket_maxima() {
        let mut samples = vec![0.1f32; 1_000];
        samples.extend(vec![0.8f32; 1_000]);
        let audio = AudioBuffer::new(samples, 16_000);
        let peaks = compute_peaks(&audio, 2);
        assert_eq!(peaks.len(), 2);
        assert!((peaks[0] - 0.1).abs() < 1e-6);
        assert!((peaks[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn peaks_of_empty_audio_are_empty() {
        assert!(compute_peaks(&AudioBuffer::new(vec![], 16_000), 10).is_empty());
        assert!(compute_peaks(&AudioBuffer::new(vec![0.1; 100], 16_000), 0).is_empty());
    }

    #[test]
    fn peaks_with_more_buckets_than_samples() {
        let audio = AudioBuffer::new(vec![0.5; 4], 16_000);
        let peaks = compute_peaks(&audio, 16);
        assert_eq!(peaks.len(), 16);
    }

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let audio = AudioBuffer::new(vec![0.25; 3_200], PIPELINE_SAMPLE_RATE);
        write_wav(&path, &audio).unwrap();
        let back = read_wav(&path).unwrap();
        assert_eq!(back.sample_rate, PIPELINE_SAMPLE_RATE);
        assert_eq!(back.samples.len(), 3_200);
        assert!((back.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn browser_playable_extensions() {
        assert!(is_browser_playable(Path::new("a/movie.MP4")));
        assert!(is_browser_playable(Path::new("clip.webm")));
        assert!(!is_browser_playable(Path::new("clip.mkv")));
        assert!(!is_browser_playable(Path::new("noext")));
    }
}
