//! Scriba server entry point.
//!
//! One binary, one subcommand:
//!
//! ```text
//! scriba serve --host 127.0.0.1 --port 8080 --jobs-dir jobs --input-dir input
//! ```
//!
//! Engine model paths are wired through the environment
//! (`SCRIBA_VAD_CMD`, `SCRIBA_PRIMARY_ASR_CMD`, …, see
//! `scriba_core::engines::command`); with nothing configured the stub
//! engines keep the whole surface exercisable.

mod error;
mod jobs;
mod media;
mod state;
mod stream;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use scriba_core::engines::command::{CommandEngineProvider, CommandSet};
use scriba_core::engines::EngineProvider;
use scriba_core::{hardware, CheckpointStore, EventBus, JobStore, ModelManager, Scheduler};

use state::AppState;

#[derive(Parser)]
#[command(name = "scriba", about = "Video-to-subtitle pipeline service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/SSE server.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Per-job checkpoint/artifact directory.
    #[arg(long, default_value = "jobs")]
    jobs_dir: PathBuf,
    /// Directory the batch-intake endpoint reads from.
    #[arg(long, default_value = "input")]
    input_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scriba_core=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let profile = hardware::detect();
    let policy = profile.policy();

    std::fs::create_dir_all(&args.input_dir)?;
    let checkpoints = Arc::new(CheckpointStore::new(&args.jobs_dir)?);

    let commands = CommandSet::from_env();
    if commands.is_empty() {
        info!("no engine commands configured — using stub engines");
    }
    let provider: Arc<dyn EngineProvider> = Arc::new(CommandEngineProvider::new(commands));
    let models = Arc::new(ModelManager::new(provider, policy.both_models_fit));

    let bus = Arc::new(EventBus::new());
    let store = Arc::new(JobStore::new());
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&checkpoints),
        models,
        policy,
    );

    // Resume: every non-terminal checkpoint re-enters the queue (QUEUED) or
    // waits for the user (PAUSED).
    let restored = checkpoints.scan();
    info!(count = restored.len(), "restored checkpointed jobs");
    scheduler.restore(restored);

    let app_state = AppState {
        scheduler,
        store,
        bus,
        checkpoints,
        hardware: profile,
        input_dir: args.input_dir,
        proxies_in_flight: Arc::new(Mutex::new(HashSet::new())),
    };

    let app = router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "scriba listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        // Intake + job control
        .route("/api/upload", post(jobs::upload))
        .route("/api/jobs/batch", post(jobs::batch))
        .route("/api/start/{job_id}", post(jobs::start))
        .route("/api/pause/{job_id}", post(jobs::pause))
        .route("/api/resume/{job_id}", post(jobs::resume))
        .route("/api/cancel/{job_id}", post(jobs::cancel))
        .route("/api/jobs/reorder", post(jobs::reorder))
        .route("/api/jobs/{job_id}/title", patch(jobs::rename))
        // Job views
        .route("/api/jobs", get(jobs::list))
        .route("/api/jobs/{job_id}", get(jobs::detail))
        .route("/api/jobs/{job_id}/text", get(jobs::text))
        .route("/api/hardware", get(jobs::hardware))
        // Media
        .route("/api/media/{job_id}/audio", get(media::audio))
        .route("/api/media/{job_id}/video", get(media::video))
        .route("/api/media/{job_id}/peaks", get(media::peaks))
        .route("/api/media/{job_id}/thumbnails", get(media::thumbnails))
        .route(
            "/api/media/{job_id}/srt",
            get(media::get_srt).put(media::put_srt),
        )
        // Events
        .route("/api/stream/{job_id}", get(stream::job_stream))
        .route("/api/stream", get(stream::global_stream))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use scriba_core::engines::stub::StubEngineProvider;
    use scriba_core::job::{JobManifest, JobRecord, JobStatus};

    fn test_state(dir: &std::path::Path) -> AppState {
        let checkpoints = Arc::new(CheckpointStore::new(dir.join("jobs")).unwrap());
        let models = Arc::new(ModelManager::new(Arc::new(StubEngineProvider), false));
        let profile = hardware::detect();
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(JobStore::new());
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&checkpoints),
            models,
            scriba_core::hardware::HardwareProfile {
                has_accelerator: false,
                accelerator_name: None,
                accelerator_memory_mb: 0,
                cpu_cores: 2,
            }
            .policy(),
        );
        AppState {
            scheduler,
            store,
            bus,
            checkpoints,
            hardware: profile,
            input_dir: dir.join("input"),
            proxies_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn seed_job(state: &AppState, id: &str, status: JobStatus) {
        let mut manifest = JobManifest::new(
            id.into(),
            id.into(),
            state.checkpoints.input_path(id, "mp4"),
            format!("{id}.mp4"),
        );
        manifest.status = status;
        state.store.insert(JobRecord::new(manifest));
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn hardware_endpoint_reports_profile() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/hardware")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["profile"]["cpu_cores"].as_u64().unwrap() >= 1);
        assert!(json["policy"].get("concurrency").is_some());
    }

    #[tokio::test]
    async fn jobs_list_pages() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_job(&state, "a", JobStatus::Created);
        seed_job(&state, "b", JobStatus::Created);
        seed_job(&state, "c", JobStatus::Created);

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/jobs?offset=1&limit=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/jobs/ghost/text")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_on_finished_job_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_job(&state, "done", JobStatus::Finished);

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/start/done")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reorder_with_unknown_id_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/reorder")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"order":["ghost"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_srt_validates_body() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_job(&state, "a", JobStatus::Finished);
        state.checkpoints.create_job_dir("a").unwrap();

        let app = router(state.clone());
        let bad = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/media/a/srt")
                    .body(Body::from("not srt at all"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let app = router(state.clone());
        let good = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/media/a/srt")
                    .body(Body::from("1\n00:00:00,000 --> 00:00:02,000\nhello\n\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        let saved = std::fs::read_to_string(state.checkpoints.srt_path("a")).unwrap();
        assert!(saved.contains("hello"));
    }

    #[tokio::test]
    async fn batch_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        std::fs::create_dir_all(&state.input_dir).unwrap();
        std::fs::write(state.input_dir.join("real.mp4"), b"data").unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/batch")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"filenames":["real.mp4","missing.mp4","../evil"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["succeeded"].as_array().unwrap().len(), 1);
        assert_eq!(json["failed_count"], 2);
    }
}
