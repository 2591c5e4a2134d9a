//! Spectrum classifier — per-chunk acoustic diagnosis.
//!
//! A pure function of one chunk's samples: frame the signal, extract a
//! feature vector (ZCR, centroid, bandwidth, flatness, rolloff,
//! harmonic-to-total ratio, RMS stats, high-frequency fraction, onset
//! strength, tempo), then fold a configurable table of thresholded score
//! contributions into music/noise/clean scores. The verdict picks the
//! separator tier the pre-separation stage will use.

use rustfft::{num_complex::Complex32, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::audio::AudioBuffer;
use crate::chunk::SeparationTier;

/// Acoustic verdict for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectrumVerdict {
    Clean,
    Music,
    Noise,
    Mixed,
}

/// Which separator the diagnosis recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorChoice {
    None,
    Light,
    Heavy,
}

impl SeparatorChoice {
    pub fn as_tier(self) -> Option<SeparationTier> {
        match self {
            SeparatorChoice::None => None,
            SeparatorChoice::Light => Some(SeparationTier::Light),
            SeparatorChoice::Heavy => Some(SeparationTier::Heavy),
        }
    }
}

/// Extracted acoustic features. `rms_var` is relative (variance over squared
/// mean) so thresholds are level-independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub zcr_mean: f32,
    pub zcr_var: f32,
    pub centroid_hz: f32,
    pub bandwidth_hz: f32,
    pub flatness: f32,
    pub rolloff_hz: f32,
    pub harmonic_ratio: f32,
    pub rms_mean: f32,
    pub rms_var: f32,
    pub hf_fraction: f32,
    pub onset_strength: f32,
    pub tempo_bpm: f32,
}

/// Immutable diagnosis record for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumDiagnosis {
    pub chunk_index: usize,
    pub verdict: SpectrumVerdict,
    pub music_score: f32,
    pub noise_score: f32,
    pub clean_score: f32,
    pub recommended_separator: SeparatorChoice,
    pub features: FeatureVector,
}

impl SpectrumDiagnosis {
    pub fn need_separation(&self) -> bool {
        self.recommended_separator != SeparatorChoice::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ZcrMean,
    ZcrVar,
    Centroid,
    Bandwidth,
    Flatness,
    Rolloff,
    HarmonicRatio,
    RmsMean,
    RmsVar,
    HfFraction,
    OnsetStrength,
    Tempo,
}

/// One additive contribution: when the feature lies in `[min, max]`
/// (either bound optional), add the listed amounts to each score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRule {
    pub feature: Feature,
    pub min: Option<f32>,
    pub max: Option<f32>,
    #[serde(default)]
    pub music: f32,
    #[serde(default)]
    pub noise: f32,
    #[serde(default)]
    pub clean: f32,
}

impl ScoreRule {
    fn matches(&self, value: f32) -> bool {
        self.min.map(|m| value >= m).unwrap_or(true) && self.max.map(|m| value <= m).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumConfig {
    pub frame_size: usize,
    pub hop: usize,
    /// Frames with RMS below this are skipped from spectral statistics.
    pub silence_rms: f32,
    pub music_threshold: f32,
    pub noise_threshold: f32,
    /// Music score at or above this recommends the heavy separator.
    pub heavy_threshold: f32,
    pub rules: Vec<ScoreRule>,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        let rule = |feature, min, max, music, noise, clean| ScoreRule {
            feature,
            min,
            max,
            music,
            noise,
            clean,
        };
        Self {
            frame_size: 1024,
            hop: 512,
            silence_rms: 1e-4,
            music_threshold: 2.5,
            noise_threshold: 2.5,
            heavy_threshold: 4.0,
            rules: vec![
                // Strong tonal structure reads as music.
                rule(Feature::HarmonicRatio, Some(0.70), None, 2.0, 0.0, 0.0),
                rule(Feature::Flatness, None, Some(0.15), 1.5, 0.0, 0.0),
                rule(Feature::ZcrMean, None, Some(0.12), 0.5, 0.0, 0.0),
                rule(Feature::Tempo, Some(30.0), None, 1.0, 0.0, 0.0),
                // Broadband, bright, stationary content reads as noise.
                rule(Feature::Flatness, Some(0.35), None, 0.0, 2.0, 0.0),
                rule(Feature::ZcrMean, Some(0.45), None, 0.0, 1.0, 0.0),
                rule(Feature::HfFraction, Some(0.35), None, 0.0, 1.0, 0.0),
                rule(Feature::RmsVar, None, Some(0.1), 0.0, 0.5, 0.0),
                // Mid-band, moderately flat, speech-like.
                rule(Feature::Flatness, Some(0.15), Some(0.35), 0.0, 0.0, 1.0),
                rule(Feature::HfFraction, None, Some(0.35), 0.0, 0.0, 0.5),
                rule(Feature::ZcrMean, Some(0.02), Some(0.40), 0.0, 0.0, 0.5),
            ],
        }
    }
}

pub struct SpectrumClassifier {
    config: SpectrumConfig,
}

impl SpectrumClassifier {
    pub fn new(config: SpectrumConfig) -> Self {
        Self { config }
    }

    pub fn diagnose(&self, chunk_index: usize, audio: &AudioBuffer) -> SpectrumDiagnosis {
        let features = self.extract(audio);

        // A chunk with no analyzable energy is trivially clean; the ≤-bounded
        // rules must not fire on all-zero features.
        if features.rms_mean < self.config.silence_rms {
            return SpectrumDiagnosis {
                chunk_index,
                verdict: SpectrumVerdict::Clean,
                music_score: 0.0,
                noise_score: 0.0,
                clean_score: 0.0,
                recommended_separator: SeparatorChoice::None,
                features,
            };
        }

        let (mut music, mut noise, mut clean) = (0.0f32, 0.0f32, 0.0f32);
        for r in &self.config.rules {
            let value = feature_value(&features, r.feature);
            if r.matches(value) {
                music += r.music;
                noise += r.noise;
                clean += r.clean;
            }
        }

        let verdict = if music >= self.config.music_threshold && music >= noise {
            SpectrumVerdict::Music
        } else if noise >= self.config.noise_threshold {
            SpectrumVerdict::Noise
        } else if clean >= music.max(noise) {
            SpectrumVerdict::Clean
        } else {
            SpectrumVerdict::Mixed
        };

        let recommended_separator = if music >= self.config.heavy_threshold {
            SeparatorChoice::Heavy
        } else if verdict != SpectrumVerdict::Clean {
            SeparatorChoice::Light
        } else {
            SeparatorChoice::None
        };

        SpectrumDiagnosis {
            chunk_index,
            verdict,
            music_score: music,
            noise_score: noise,
            clean_score: clean,
            recommended_separator,
            features,
        }
    }

    /// Feature extraction over Hann-windowed frames.
    fn extract(&self, audio: &AudioBuffer) -> FeatureVector {
        let n = self.config.frame_size;
        let hop = self.config.hop.max(1);
        if audio.samples.len() < n {
            return FeatureVector::default();
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let window: Vec<f32> = (0..n)
            .map(|i| {
                let x = std::f32::consts::PI * 2.0 * i as f32 / n as f32;
                0.5 * (1.0 - x.cos())
            })
            .collect();

        let bins = n / 2;
        let hz_per_bin = audio.sample_rate as f32 / n as f32;
        let hf_bin = (4_000.0 / hz_per_bin) as usize;

        let mut spectra: Vec<Vec<f32>> = Vec::new();
        let mut zcrs: Vec<f32> = Vec::new();
        let mut rmses: Vec<f32> = Vec::new();
        let mut centroids: Vec<f32> = Vec::new();
        let mut bandwidths: Vec<f32> = Vec::new();
        let mut flatnesses: Vec<f32> = Vec::new();
        let mut rolloffs: Vec<f32> = Vec::new();

        let mut scratch = vec![Complex32::default(); n];
        let mut start = 0usize;
        while start + n <= audio.samples.len() {
            let frame = &audio.samples[start..start + n];
            start += hop;

            let rms = (frame.iter().map(|s| s * s).sum::<f32>() / n as f32).sqrt();
            rmses.push(rms);
            if rms < self.config.silence_rms {
                continue;
            }
            zcrs.push(zero_crossing_rate(frame));

            for (i, (s, w)) in frame.iter().zip(&window).enumerate() {
                scratch[i] = Complex32::new(s * w, 0.0);
            }
            fft.process(&mut scratch);
            let mags: Vec<f32> = scratch[..bins].iter().map(|c| c.norm()).collect();

            let total: f32 = mags.iter().sum();
            if total > 1e-9 {
                let centroid = mags
                    .iter()
                    .enumerate()
                    .map(|(k, m)| k as f32 * hz_per_bin * m)
                    .sum::<f32>()
                    / total;
                centroids.push(centroid);
                let bw = (mags
                    .iter()
                    .enumerate()
                    .map(|(k, m)| {
                        let d = k as f32 * hz_per_bin - centroid;
                        d * d * m
                    })
                    .sum::<f32>()
                    / total)
                    .sqrt();
                bandwidths.push(bw);
                flatnesses.push(spectral_flatness(&mags));
                rolloffs.push(spectral_rolloff(&mags, hz_per_bin, 0.85));
            }

            spectra.push(mags);
        }

        if spectra.is_empty() {
            return FeatureVector {
                rms_mean: mean(&rmses),
                ..FeatureVector::default()
            };
        }

        let rms_mean = mean(&rmses);
        let rms_var = if rms_mean > 1e-9 {
            variance(&rmses) / (rms_mean * rms_mean)
        } else {
            0.0
        };

        // High-frequency energy fraction over the whole chunk.
        let (mut hf_energy, mut total_energy) = (0.0f64, 0.0f64);
        for mags in &spectra {
            for (k, m) in mags.iter().enumerate() {
                let p = (*m as f64) * (*m as f64);
                total_energy += p;
                if k >= hf_bin {
                    hf_energy += p;
                }
            }
        }
        let hf_fraction = if total_energy > 0.0 {
            (hf_energy / total_energy) as f32
        } else {
            0.0
        };

        let onsets = onset_envelope(&spectra);
        let onset_strength = mean(&onsets);
        let frame_rate = audio.sample_rate as f32 / hop as f32;
        let tempo_bpm = estimate_tempo(&onsets, frame_rate);

        FeatureVector {
            zcr_mean: mean(&zcrs),
            zcr_var: variance(&zcrs),
            centroid_hz: mean(&centroids),
            bandwidth_hz: mean(&bandwidths),
            flatness: mean(&flatnesses),
            rolloff_hz: mean(&rolloffs),
            harmonic_ratio: harmonic_ratio(&spectra),
            rms_mean,
            rms_var,
            hf_fraction,
            onset_strength,
            tempo_bpm,
        }
    }
}

impl Default for SpectrumClassifier {
    fn default() -> Self {
        Self::new(SpectrumConfig::default())
    }
}

fn feature_value(f: &FeatureVector, which: Feature) -> f32 {
    match which {
        Feature::ZcrMean => f.zcr_mean,
        Feature::ZcrVar => f.zcr_var,
        Feature::Centroid => f.centroid_hz,
        Feature::Bandwidth => f.bandwidth_hz,
        Feature::Flatness => f.flatness,
        Feature::Rolloff => f.rolloff_hz,
        Feature::HarmonicRatio => f.harmonic_ratio,
        Feature::RmsMean => f.rms_mean,
        Feature::RmsVar => f.rms_var,
        Feature::HfFraction => f.hf_fraction,
        Feature::OnsetStrength => f.onset_strength,
        Feature::Tempo => f.tempo_bpm,
    }
}

fn mean(v: &[f32]) -> f32 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f32>() / v.len() as f32
    }
}

fn variance(v: &[f32]) -> f32 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    v.iter().map(|x| (x - m) * (x - m)).sum::<f32>() / v.len() as f32
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / (frame.len() - 1) as f32
}

/// Geometric over arithmetic mean of the power spectrum.
fn spectral_flatness(mags: &[f32]) -> f32 {
    const EPS: f32 = 1e-12;
    let mut log_sum = 0.0f32;
    let mut sum = 0.0f32;
    for m in mags {
        let p = m * m + EPS;
        log_sum += p.ln();
        sum += p;
    }
    let n = mags.len() as f32;
    let gm = (log_sum / n).exp();
    let am = sum / n;
    (gm / am).clamp(0.0, 1.0)
}

fn spectral_rolloff(mags: &[f32], hz_per_bin: f32, fraction: f32) -> f32 {
    let total: f32 = mags.iter().map(|m| m * m).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let target = total * fraction;
    let mut acc = 0.0f32;
    for (k, m) in mags.iter().enumerate() {
        acc += m * m;
        if acc >= target {
            return k as f32 * hz_per_bin;
        }
    }
    (mags.len() - 1) as f32 * hz_per_bin
}

/// Harmonic-to-total energy via a median-filter harmonic/percussive split:
/// a bin is harmonic when its time-axis median exceeds its frequency-axis
/// median (sustained across frames rather than spread across bins).
fn harmonic_ratio(spectra: &[Vec<f32>]) -> f32 {
    const WIN: usize = 9;
    if spectra.is_empty() {
        return 0.0;
    }
    let bins = spectra[0].len();
    let frames = spectra.len();

    let mut harmonic = 0.0f64;
    let mut total = 0.0f64;
    let mut buf = Vec::with_capacity(WIN);

    for t in 0..frames {
        for k in 0..bins {
            let p = (spectra[t][k] as f64) * (spectra[t][k] as f64);
            total += p;

            buf.clear();
            let lo = t.saturating_sub(WIN / 2);
            let hi = (t + WIN / 2 + 1).min(frames);
            for row in &spectra[lo..hi] {
                buf.push(row[k]);
            }
            let h_med = median(&mut buf);

            buf.clear();
            let lo = k.saturating_sub(WIN / 2);
            let hi = (k + WIN / 2 + 1).min(bins);
            buf.extend_from_slice(&spectra[t][lo..hi]);
            let p_med = median(&mut buf);

            if h_med >= p_med {
                harmonic += p;
            }
        }
    }
    if total > 0.0 {
        (harmonic / total) as f32
    } else {
        0.0
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}

/// Per-frame positive spectral flux over L1-normalised magnitudes, so the
/// envelope is level-independent.
fn onset_envelope(spectra: &[Vec<f32>]) -> Vec<f32> {
    let mut out = Vec::with_capacity(spectra.len());
    let mut prev: Option<Vec<f32>> = None;
    for mags in spectra {
        let total: f32 = mags.iter().sum();
        let norm: Vec<f32> = if total > 1e-9 {
            mags.iter().map(|m| m / total).collect()
        } else {
            vec![0.0; mags.len()]
        };
        if let Some(p) = &prev {
            let flux: f32 = norm
                .iter()
                .zip(p)
                .map(|(a, b)| (a - b).max(0.0))
                .sum();
            out.push(flux);
        }
        prev = Some(norm);
    }
    out
}

/// Autocorrelation peak of the mean-centered onset envelope in the
/// 30–240 BPM lag band. Centering matters: a flat-but-positive envelope
/// (steady noise) autocorrelates near 1 raw, but has no periodicity.
/// Returns 0 when the envelope is too weak or aperiodic.
fn estimate_tempo(onsets: &[f32], frame_rate: f32) -> f32 {
    if onsets.len() < 8 {
        return 0.0;
    }
    let m = mean(onsets);
    let centered: Vec<f32> = onsets.iter().map(|o| o - m).collect();
    let energy: f32 = centered.iter().map(|c| c * c).sum();
    if energy < 1e-9 {
        return 0.0;
    }
    let min_lag = ((60.0 * frame_rate / 240.0) as usize).max(1);
    let max_lag = ((60.0 * frame_rate / 30.0) as usize).min(centered.len() - 1);
    if min_lag >= max_lag {
        return 0.0;
    }

    let mut best_lag = 0usize;
    let mut best_r = 0.0f32;
    for lag in min_lag..=max_lag {
        let r: f32 = centered
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| a * b)
            .sum::<f32>()
            / energy;
        if r > best_r {
            best_r = r;
            best_lag = lag;
        }
    }
    if best_r >= 0.5 && best_lag > 0 {
        60.0 * frame_rate / best_lag as f32
    } else {
        0.0
    }
}
