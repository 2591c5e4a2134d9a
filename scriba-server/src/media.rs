//! Media accessors: served audio/video, waveform peaks, thumbnails and the
//! SRT artifact.

use std::path::Path;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use scriba_core::{media, srt, ScribaError};

use crate::error::{not_found, protocol, ApiResult};
use crate::state::AppState;

async fn serve_file(path: &Path, content_type: &str) -> ApiResult<Response> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.to_string())],
            Body::from(bytes),
        )
            .into_response()),
        Err(_) => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "artifact not available yet" })),
        )
            .into_response()),
    }
}

fn ensure_job(state: &AppState, job_id: &str) -> ApiResult<()> {
    if state.store.contains(job_id) {
        Ok(())
    } else {
        Err(not_found(job_id))
    }
}

/// GET /api/media/{job_id}/audio — the extracted WAV artifact.
pub async fn audio(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Response> {
    ensure_job(&state, &job_id)?;
    serve_file(&state.checkpoints.audio_path(&job_id), "audio/wav").await
}

/// GET /api/media/{job_id}/video — the input container when browser
/// playable, an existing proxy otherwise; kicks off proxy generation and
/// answers `202 {status:"generating"}` while it runs.
pub async fn video(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Response> {
    let record = state.store.get(&job_id).ok_or_else(|| not_found(&job_id))?;
    let input = record.manifest.input_path.clone();

    if media::is_browser_playable(&input) {
        return serve_file(&input, "video/mp4").await;
    }

    let proxy = state.checkpoints.proxy_path(&job_id);
    if proxy.is_file() {
        return serve_file(&proxy, "video/mp4").await;
    }

    // Remux once; concurrent requests just observe the in-flight flag.
    let started = state.proxies_in_flight.lock().insert(job_id.clone());
    if started {
        let in_flight = state.proxies_in_flight.clone();
        let job = job_id.clone();
        info!(job_id, "starting proxy generation");
        tokio::task::spawn_blocking(move || {
            if let Err(e) = media::remux_proxy(&input, &proxy) {
                warn!(job_id = job, error = %e, "proxy generation failed");
            }
            in_flight.lock().remove(&job);
        });
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "generating", "job_id": job_id })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct PeaksQuery {
    pub samples: Option<usize>,
}

/// GET /api/media/{job_id}/peaks?samples=N
pub async fn peaks(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<PeaksQuery>,
) -> ApiResult<Json<media::PeaksFile>> {
    ensure_job(&state, &job_id)?;
    let samples = query.samples.unwrap_or(1_000).clamp(16, 20_000);

    let path = state.checkpoints.peaks_path(&job_id);
    if let Ok(raw) = tokio::fs::read_to_string(&path).await {
        if let Ok(file) = serde_json::from_str::<media::PeaksFile>(&raw) {
            return Ok(Json(resample_peaks(file, samples)));
        }
    }

    // No cached peaks yet — derive from the audio artifact.
    let wav = state.checkpoints.audio_path(&job_id);
    let file = tokio::task::spawn_blocking(move || -> Result<media::PeaksFile, ScribaError> {
        let audio = media::read_wav(&wav)?;
        Ok(media::PeaksFile {
            duration: audio.duration_secs(),
            peaks: media::compute_peaks(&audio, samples),
        })
    })
    .await
    .map_err(|e| ScribaError::Other(anyhow::anyhow!("peaks task: {e}")))??;
    Ok(Json(file))
}

/// Max-pool cached peaks down (or pass through) to the requested count.
fn resample_peaks(file: media::PeaksFile, samples: usize) -> media::PeaksFile {
    if file.peaks.is_empty() || samples >= file.peaks.len() {
        return file;
    }
    let ratio = file.peaks.len() as f64 / samples as f64;
    let peaks = (0..samples)
        .map(|i| {
            let lo = (i as f64 * ratio) as usize;
            let hi = (((i + 1) as f64 * ratio) as usize).min(file.peaks.len());
            file.peaks[lo..hi.max(lo + 1)]
                .iter()
                .fold(0.0f32, |acc, p| acc.max(*p))
        })
        .collect();
    media::PeaksFile {
        duration: file.duration,
        peaks,
    }
}

#[derive(Deserialize)]
pub struct ThumbnailQuery {
    pub count: Option<usize>,
}

/// GET /api/media/{job_id}/thumbnails?count=N — generates on first request.
pub async fn thumbnails(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<ThumbnailQuery>,
) -> ApiResult<Json<Value>> {
    let record = state.store.get(&job_id).ok_or_else(|| not_found(&job_id))?;
    let count = query.count.unwrap_or(10).clamp(1, 60);
    let duration = record.manifest.duration_secs.unwrap_or(0.0);
    if duration <= 0.0 {
        return Err(protocol("media duration unknown — job not yet extracted"));
    }

    let input = record.manifest.input_path.clone();
    let dir = state.checkpoints.thumbnails_dir(&job_id);
    let thumbs = tokio::task::spawn_blocking(move || {
        media::generate_thumbnails(&input, &dir, count, duration)
    })
    .await
    .map_err(|e| ScribaError::Other(anyhow::anyhow!("thumbnail task: {e}")))??;

    let timestamps: Vec<f64> = thumbs.iter().map(|(t, _)| *t).collect();
    let paths: Vec<String> = thumbs
        .iter()
        .map(|(_, p)| p.to_string_lossy().to_string())
        .collect();
    Ok(Json(json!({ "timestamps": timestamps, "thumbnails": paths })))
}

/// GET /api/media/{job_id}/srt — the final artifact as text.
pub async fn get_srt(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Response> {
    ensure_job(&state, &job_id)?;
    serve_file(
        &state.checkpoints.srt_path(&job_id),
        "text/plain; charset=utf-8",
    )
    .await
}

/// PUT /api/media/{job_id}/srt — editor save. The body must parse as SRT.
pub async fn put_srt(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    body: String,
) -> ApiResult<Json<Value>> {
    ensure_job(&state, &job_id)?;
    let entries = srt::parse(&body)?;
    tokio::fs::write(state.checkpoints.srt_path(&job_id), body.as_bytes())
        .await
        .map_err(ScribaError::from)?;
    info!(job_id, entries = entries.len(), "SRT overwritten by editor");
    Ok(Json(json!({ "job_id": job_id, "entries": entries.len() })))
}
