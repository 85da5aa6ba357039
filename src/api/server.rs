use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::sessions::{self, SessionStore};
use crate::pipeline::agent::{ImageEditAgent, EXAMPLE_INSTRUCTIONS};

/// Uploads arrive base64-encoded inside JSON, so the limit sits well above
/// typical photo sizes.
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub backgrounds_dir: PathBuf,
    pub agent: Arc<ImageEditAgent>,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(agent: Arc<ImageEditAgent>, backgrounds_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_name: "backdrop-agent",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            backgrounds_dir: backgrounds_dir.into(),
            agent,
            sessions: SessionStore::default(),
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.sessions = SessionStore::bounded(max_sessions);
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", post(sessions::create_session_handler))
        .route(
            "/api/sessions/{session_id}",
            delete(sessions::delete_session_handler),
        )
        .route(
            "/api/sessions/{session_id}/backgrounds",
            get(sessions::list_backgrounds_handler),
        )
        .route(
            "/api/sessions/{session_id}/backgrounds/refresh",
            post(sessions::refresh_backgrounds_handler),
        )
        .route(
            "/api/sessions/{session_id}/edit",
            post(sessions::edit_image_handler),
        )
        .route(
            "/api/sessions/{session_id}/result",
            get(sessions::get_result_handler),
        )
        .route(
            "/api/sessions/{session_id}/result.png",
            get(sessions::download_result_png_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let backgrounds_dir = state.backgrounds_dir.display().to_string();
    let app = build_router(state);
    info!(bind = %addr, backgrounds_dir = %backgrounds_dir, "starting backdrop-agent HTTP surface");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let session_count = state.sessions.len().await;
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
            "session_count": session_count,
            "max_sessions": state.sessions.max_sessions(),
            "example_instructions": EXAMPLE_INSTRUCTIONS,
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
