use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use songfall_proto::protocol::{Command, PlaybackStatus, ResolutionPhase, SourceInfo};
use songfall_proto::state::StateManager;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::core::DaemonEvent;

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ApiState {
    sources: Vec<SourceView>,
    default_source: usize,
    song_id: Option<String>,
    phase: ResolutionPhase,
    active_source: Option<usize>,
    attempts: usize,
    audio_url: Option<String>,
    last_error: Option<String>,
    volume: f32,
    playback_status: PlaybackStatus,
}

#[derive(Serialize)]
struct SourceView {
    idx: usize,
    #[serde(flatten)]
    info: SourceInfo,
}

pub fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play/:song_id", get(play).post(play))
        .route("/api/source/next", get(next_source).post(next_source))
        .route("/api/source/:index", get(switch_source).post(switch_source))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/pause", get(toggle_pause).post(toggle_pause))
        .route("/api/volume/:volume", get(set_volume).post(set_volume))
        .layer(CorsLayer::permissive())
        .with_state(HttpState {
            state_manager,
            event_tx,
        })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };
        info!("HTTP API server listening on http://{}", addr);
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let s = state.state_manager.get_state().await;
    Json(ApiState {
        sources: s
            .sources
            .into_iter()
            .enumerate()
            .map(|(idx, info)| SourceView { idx, info })
            .collect(),
        default_source: s.default_source,
        song_id: s.song_id,
        phase: s.phase,
        active_source: s.active_source,
        attempts: s.attempts,
        audio_url: s.audio_url,
        last_error: s.last_error,
        volume: s.volume,
        playback_status: s.playback_status,
    })
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: daemon event channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn play(State(state): State<HttpState>, Path(song_id): Path<String>) -> StatusCode {
    dispatch(&state, Command::Play { song_id }).await
}

async fn switch_source(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    if index >= state.state_manager.get_state().await.sources.len() {
        return StatusCode::NOT_FOUND;
    }
    dispatch(&state, Command::SwitchSource { index }).await
}

async fn next_source(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::NextSource).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Stop).await
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::TogglePause).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = (volume as f32 / 100.0).clamp(0.0, 1.0);
    dispatch(&state, Command::Volume { value }).await
}
