//! SSE endpoints: one stream per job (with Last-Event-ID replay) and a
//! global lane multiplexing `signal.*` / `progress.overall` across jobs.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use futures_util::stream::Stream;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Interval;
use tracing::debug;

use scriba_core::events::Envelope;

use crate::error::{not_found, ApiResult};
use crate::state::AppState;

/// Heartbeat cadence for every SSE connection.
const HEARTBEAT_SECS: u64 = 15;

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn envelope_event(env: &Envelope, with_id: bool) -> Event {
    let event = Event::default()
        .event(env.payload.tag())
        .data(env.body().to_string());
    if with_id {
        event.id(env.seq.to_string())
    } else {
        event
    }
}

/// First tick lands one period out, not immediately on connect.
fn heartbeat_interval() -> Interval {
    let period = Duration::from_secs(HEARTBEAT_SECS);
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

fn heartbeat_event() -> Event {
    Event::default()
        .event("heartbeat")
        .data(json!({ "timestamp": chrono::Utc::now().timestamp_millis() }).to_string())
}

fn replay_gap_event(job_id: &str) -> Event {
    Event::default()
        .event("signal.replay_gap")
        .data(json!({ "job_id": job_id, "signal": "replay_gap" }).to_string())
}

struct StreamState {
    job_id: String,
    pending: std::collections::VecDeque<Event>,
    live: broadcast::Receiver<Envelope>,
    heartbeat: Interval,
    with_ids: bool,
}

/// Pull loop shared by both endpoints: drain any replay backlog, then
/// interleave live events with heartbeats. A lagged receiver (slow
/// consumer whose buffer overflowed) surfaces a replay gap and keeps
/// following from the newest event.
fn event_stream(state: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(state, |mut st| async move {
        if let Some(event) = st.pending.pop_front() {
            return Some((Ok(event), st));
        }
        tokio::select! {
            _ = st.heartbeat.tick() => Some((Ok(heartbeat_event()), st)),
            received = st.live.recv() => match received {
                Ok(env) => {
                    let event = envelope_event(&env, st.with_ids);
                    Some((Ok(event), st))
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(job_id = st.job_id, skipped, "subscriber lagged");
                    Some((Ok(replay_gap_event(&st.job_id)), st))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        }
    })
}

/// GET /api/stream/{job_id}
pub async fn job_stream(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if !state.store.contains(&job_id) {
        return Err(not_found(&job_id));
    }
    let after = last_event_id(&headers);
    let subscription = state.bus.subscribe(&job_id, after);

    let mut pending = std::collections::VecDeque::new();
    if subscription.gap {
        pending.push_back(replay_gap_event(&job_id));
    }
    for env in &subscription.replay {
        pending.push_back(envelope_event(env, true));
    }
    debug!(
        job_id,
        ?after,
        replayed = subscription.replay.len(),
        gap = subscription.gap,
        "SSE subscriber attached"
    );

    let stream = event_stream(StreamState {
        job_id,
        pending,
        live: subscription.live,
        heartbeat: heartbeat_interval(),
        with_ids: true,
    });
    Ok(Sse::new(stream))
}

/// GET /api/stream — the cross-job lane for task-list views. Sequence ids
/// are per-job, so global events carry no `id:` line.
pub async fn global_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let live = state.bus.subscribe_global();
    let stream = event_stream(StreamState {
        job_id: String::from("*"),
        pending: std::collections::VecDeque::new(),
        live,
        heartbeat: heartbeat_interval(),
        with_ids: false,
    });
    Sse::new(stream)
}
