//! ==============================================================================
//! server.rs - web server
//! ==============================================================================
//!
//! routes:
//!     GET  /              html page (charts, start/pause/stop)
//!     GET  /mon.sse       live feed as server-sent events, gated to one client
//!     GET  /mon.json      latest sample
//!     GET  /mon/history   recent samples, oldest first
//!     POST /mon/stop      release the feed (?session=<id>)
//!     GET  /mon/session   who holds the feed
//!
//! sse framing on /mon.sse:
//!     event: session   {"id": N}            once, right after admission
//!     data: <sample>                        one per delivered sample
//!     : keepalive                           when no new sample arrived
//!     event: end       {"reason": "..."}    last event before the stream closes
//!
//!     the page closes its EventSource on `end`; otherwise the browser would
//!     reconnect by itself and two tabs would keep preempting each other.
//!
//! ==============================================================================

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::dispatcher::{Delivery, Dispatcher};
use crate::domain::Sample;
use crate::feed::SampleFeed;
use crate::session::{GateState, SessionGate, SessionId};

const PAGE_HTML: &str = include_str!("../assets/index.html");

// ==============================================================================
// shared state
// ==============================================================================
// everything here is a cheap clone over Arc'd internals:
// - feed: written by the sampler, read by every handler
// - gate: the single-client session gate

#[derive(Clone)]
pub struct AppState {
    pub feed: SampleFeed,
    pub gate: SessionGate,
    /// max silence on an open stream before a keepalive comment goes out
    pub keepalive: Duration,
    page: String,
}

impl AppState {
    pub fn new(feed: SampleFeed, gate: SessionGate, keepalive: Duration) -> Self {
        let page = PAGE_HTML.replace("${hostname}", &html_escape(&hostname()));
        Self { feed, gate, keepalive, page }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/mon.sse", get(feed_handler))
        .route("/mon.json", get(latest_handler))
        .route("/mon/history", get(history_handler))
        .route("/mon/stop", post(stop_handler))
        .route("/mon/session", get(session_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(state.page.clone())
}

#[derive(Deserialize)]
struct FeedParams {
    /// minimum ms between samples, as sent by the page
    #[serde(rename = "update-rate")]
    update_rate: Option<u64>,
}

/// admit through the gate, then stream samples until the session ends
async fn feed_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<FeedParams>,
) -> Response {
    let session = match state.gate.admit(Some(peer)) {
        Ok(session) => session,
        Err(e) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"status": "busy", "message": e.to_string()})),
            )
                .into_response();
        }
    };

    let id = session.id();
    let mut dispatcher = Dispatcher::new(session, state.feed.subscribe(), state.keepalive);
    if let Some(ms) = params.update_rate {
        dispatcher = dispatcher.with_min_gap(Duration::from_millis(ms));
    }

    let hello = Event::default()
        .event("session")
        .data(serde_json::json!({ "id": id }).to_string());

    // the dispatcher lives inside the stream: when hyper drops the body
    // (client gone, write failed) the session handle drops with it
    let samples = stream::unfold(Some(dispatcher), |slot| async move {
        let mut dispatcher = slot?;
        let event = match dispatcher.next_sample().await {
            Ok(Delivery::Sample(sample)) => sample_event(&sample),
            Ok(Delivery::Idle) => Event::default().comment("keepalive"),
            Err(reason) => {
                tracing::debug!(session = %dispatcher.session_id(), %reason, "closing feed");
                let end = Event::default()
                    .event("end")
                    .data(serde_json::json!({ "reason": reason, "message": reason.to_string() }).to_string());
                return Some((end, None));
            }
        };
        Some((event, Some(dispatcher)))
    });

    let events = stream::once(async move { hello })
        .chain(samples)
        .map(Ok::<_, Infallible>);

    ([("x-accel-buffering", "no")], Sse::new(events)).into_response()
}

fn sample_event(sample: &Sample) -> Event {
    match serde_json::to_string(sample) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::error!(seq = sample.seq, error = %e, "failed to encode sample");
            Event::default().comment("encode error")
        }
    }
}

async fn latest_handler(State(state): State<AppState>) -> Response {
    match state.feed.latest() {
        Some(sample) => Json(&*sample).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "error", "message": "no sample yet"})),
        )
            .into_response(),
    }
}

async fn history_handler(State(state): State<AppState>) -> Response {
    let history = state.feed.history();
    let samples: Vec<&Sample> = history.iter().map(|s| &**s).collect();
    Json(samples).into_response()
}

#[derive(Deserialize)]
struct StopParams {
    session: Option<SessionId>,
}

/// stop control endpoint
/// POST /mon/stop?session=<id>   (no id: stop whoever holds the feed)
async fn stop_handler(
    State(state): State<AppState>,
    Query(params): Query<StopParams>,
) -> Json<serde_json::Value> {
    match state.gate.stop(params.session) {
        Some(id) => Json(serde_json::json!({"status": "stopped", "session": id})),
        None => Json(serde_json::json!({"status": "noop"})),
    }
}

async fn session_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.gate.state() {
        GateState::Empty => Json(serde_json::json!({"state": "empty"})),
        GateState::Occupied(info) => Json(serde_json::json!({
            "state": "occupied",
            "id": info.id,
            "peer": info.peer.map(|p| p.to_string()),
            "connected_ms": info.admitted_at.elapsed().as_millis() as u64,
            "idle_ms": info.last_activity.elapsed().as_millis() as u64,
        })),
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], "Not found")
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
     .replace('<', "&lt;")
     .replace('>', "&gt;")
     .replace('"', "&quot;")
}
