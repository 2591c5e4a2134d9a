//! File intake and job control endpoints.

use std::path::Path;

use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use scriba_core::job::{JobManifest, JobRecord, JobSettings, JobStatus};
use scriba_core::subtitle::Sentence;
use scriba_core::ScribaError;

use crate::error::{not_found, protocol, ApiResult};
use crate::state::AppState;

/// Reject names that could escape the intake directories.
fn sanitize_filename(name: &str) -> ApiResult<&str> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(protocol(format!("invalid filename: {name:?}")));
    }
    Ok(name)
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_ascii_lowercase()
}

fn display_title(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string()
}

fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub filename: String,
    pub queue_position: usize,
}

/// POST /api/upload — multipart intake; the job is CREATED, not yet queued.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| protocol(format!("bad multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| protocol("file field is missing a filename"))?;
        sanitize_filename(&filename)?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| protocol(format!("upload read failed: {e}")))?;
        if bytes.is_empty() {
            return Err(protocol("uploaded file is empty"));
        }

        let job_id = new_job_id();
        state.checkpoints.create_job_dir(&job_id)?;
        let input_path = state
            .checkpoints
            .input_path(&job_id, &extension_of(&filename));
        tokio::fs::write(&input_path, &bytes)
            .await
            .map_err(ScribaError::from)?;

        let manifest = JobManifest::new(
            job_id.clone(),
            display_title(&filename),
            input_path,
            filename.clone(),
        );
        state.scheduler.create(JobRecord::new(manifest))?;
        info!(job_id, filename, bytes = bytes.len(), "upload accepted");

        return Ok(Json(UploadResponse {
            job_id,
            filename,
            queue_position: state.scheduler.queue_position(),
        }));
    }
    Err(protocol("multipart body has no `file` field"))
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub filenames: Vec<String>,
}

#[derive(Serialize)]
pub struct BatchCreated {
    pub job_id: String,
    pub filename: String,
}

#[derive(Serialize)]
pub struct BatchFailure {
    pub filename: String,
    pub error: String,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub succeeded: Vec<BatchCreated>,
    pub failed_count: usize,
    pub failed: Vec<BatchFailure>,
}

/// POST /api/jobs/batch — create jobs from files already in the input dir.
pub async fn batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for filename in request.filenames {
        let outcome = batch_one(&state, &filename).await;
        match outcome {
            Ok(job_id) => succeeded.push(BatchCreated { job_id, filename }),
            Err(error) => failed.push(BatchFailure { filename, error }),
        }
    }

    Ok(Json(BatchResponse {
        failed_count: failed.len(),
        succeeded,
        failed,
    }))
}

async fn batch_one(state: &AppState, filename: &str) -> Result<String, String> {
    sanitize_filename(filename).map_err(|_| "invalid filename".to_string())?;
    let source = state.input_dir.join(filename);
    if !source.is_file() {
        return Err("file not found in input directory".into());
    }

    let job_id = new_job_id();
    state
        .checkpoints
        .create_job_dir(&job_id)
        .map_err(|e| e.to_string())?;
    let input_path = state.checkpoints.input_path(&job_id, &extension_of(filename));
    tokio::fs::copy(&source, &input_path)
        .await
        .map_err(|e| e.to_string())?;

    let manifest = JobManifest::new(
        job_id.clone(),
        display_title(filename),
        input_path,
        filename.to_string(),
    );
    state
        .scheduler
        .create(JobRecord::new(manifest))
        .map_err(|e| e.to_string())?;
    Ok(job_id)
}

/// POST /api/start/{job_id} — CREATED → QUEUED. The body, when present, is
/// the settings bundle (preset id, language hint, engine options).
pub async fn start(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    body: String,
) -> ApiResult<Json<Value>> {
    let settings: Option<JobSettings> = if body.trim().is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&body)
                .map_err(|e| protocol(format!("bad settings body: {e}")))?,
        )
    };
    state.scheduler.start(&job_id, settings)?;
    Ok(Json(json!({ "job_id": job_id, "status": "queued" })))
}

pub async fn pause(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    state.scheduler.pause(&job_id)?;
    Ok(Json(json!({ "job_id": job_id, "status": "paused" })))
}

pub async fn resume(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    state.scheduler.resume(&job_id)?;
    Ok(Json(json!({ "job_id": job_id, "status": "queued" })))
}

#[derive(Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub purge: bool,
}

pub async fn cancel(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<Value>> {
    state.scheduler.cancel(&job_id, query.purge)?;
    Ok(Json(json!({ "job_id": job_id, "status": "canceled", "purged": query.purge })))
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<String>,
}

pub async fn reorder(
    State(state): State<AppState>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<Json<Value>> {
    state.scheduler.reorder(request.order)?;
    Ok(Json(json!({ "order": state.scheduler.queued_ids() })))
}

#[derive(Deserialize)]
pub struct TitleRequest {
    pub title: String,
}

/// PATCH /api/jobs/{job_id}/title — display title only.
pub async fn rename(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Json(request): Json<TitleRequest>,
) -> ApiResult<Json<Value>> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(protocol("title must not be empty"));
    }
    let title = title.to_string();
    if !state.store.update(&job_id, |r| {
        r.manifest.title = title.clone();
        r.manifest.updated_at = chrono::Utc::now();
    }) {
        return Err(not_found(&job_id));
    }
    if let Some(record) = state.store.get(&job_id) {
        let _ = state.checkpoints.save_manifest(&record.manifest);
    }
    Ok(Json(json!({ "job_id": job_id, "title": request.title.trim() })))
}

#[derive(Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub title: String,
    pub filename: String,
    pub status: JobStatus,
    pub phase: Option<String>,
    pub progress: f64,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub duration_secs: Option<f64>,
    pub sentence_count: usize,
}

fn summarize(record: &JobRecord) -> JobSummary {
    JobSummary {
        job_id: record.manifest.job_id.clone(),
        title: record.manifest.title.clone(),
        filename: record.manifest.input_filename.clone(),
        status: record.manifest.status,
        phase: record.manifest.phase.map(|p| p.as_str().to_string()),
        progress: record.manifest.progress,
        message: record.manifest.message.clone(),
        created_at: record.manifest.created_at,
        updated_at: record.manifest.updated_at,
        duration_secs: record.manifest.duration_secs,
        sentence_count: record.sentences.len(),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// GET /api/jobs — all jobs, optionally paged.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let records = state.store.list();
    let total = records.len();
    let offset = query.offset.unwrap_or(0).min(total);
    let limit = query.limit.unwrap_or(total);
    let jobs: Vec<JobSummary> = records[offset..]
        .iter()
        .take(limit)
        .map(summarize)
        .collect();
    Json(json!({ "jobs": jobs, "total": total }))
}

#[derive(Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    pub include_media: bool,
}

/// GET /api/jobs/{job_id} — full job state.
pub async fn detail(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<DetailQuery>,
) -> ApiResult<Json<Value>> {
    let record = state.store.get(&job_id).ok_or_else(|| not_found(&job_id))?;
    let mut body = json!({
        "job": summarize(&record),
        "settings": record.manifest.settings,
        "error": record.manifest.error,
        "sentences": record.sentences,
    });
    if query.include_media {
        body["media"] = json!({
            "audio": format!("/api/media/{job_id}/audio"),
            "video": format!("/api/media/{job_id}/video"),
            "peaks": format!("/api/media/{job_id}/peaks"),
            "thumbnails": format!("/api/media/{job_id}/thumbnails"),
            "srt": format!("/api/media/{job_id}/srt"),
        });
    }
    Ok(Json(body))
}

#[derive(Serialize)]
struct TextSegment {
    start: f64,
    end: f64,
    text: String,
    confidence: f32,
}

/// GET /api/jobs/{job_id}/text — the current partial transcript.
pub async fn text(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    let record = state.store.get(&job_id).ok_or_else(|| not_found(&job_id))?;
    let segments: Vec<TextSegment> = record
        .sentences
        .iter()
        .map(|s: &Sentence| TextSegment {
            start: s.start,
            end: s.end,
            text: s.text.clone(),
            confidence: s.confidence,
        })
        .collect();
    Ok(Json(json!({
        "segments": segments,
        "progress": { "percentage": record.manifest.progress },
    })))
}

/// GET /api/hardware — capability profile and derived policy.
pub async fn hardware(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "profile": state.hardware,
        "policy": state.hardware.policy(),
    }))
}
