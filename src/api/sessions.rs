use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::api::handler_utils::{
    internal_error, into_json, not_found, validation_error, ApiObject,
};
use crate::api::server::AppState;
use crate::pipeline::agent::PlanSource;
use crate::pipeline::catalog::BackgroundCatalog;
use crate::pipeline::compositor::encode_png;
use crate::pipeline::executor::ExecutionLog;
use crate::pipeline::plan::Plan;
use crate::pipeline::settings_layer::DEFAULT_MAX_SESSIONS;

const SESSION_NOT_FOUND: &str = "Session not found";

/// Last edit produced inside a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub instruction: String,
    pub plan: Plan,
    pub plan_source: PlanSource,
    pub planning_log: Vec<String>,
    pub execution_log: Vec<String>,
    pub success: bool,
    #[serde(skip)]
    pub png: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct EditSession {
    catalog: BackgroundCatalog,
    last_result: Option<SessionResult>,
}

#[derive(Debug, Default)]
struct SessionMap {
    sessions: HashMap<Uuid, EditSession>,
    // Creation order, oldest first.
    order: VecDeque<Uuid>,
}

/// In-memory sessions keyed by id. Nothing is shared between sessions. Once
/// `max_sessions` is reached, creating a session evicts the oldest one.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<SessionMap>>,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn bounded(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionMap::default())),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    async fn insert(&self, catalog: BackgroundCatalog) -> Uuid {
        let id = Uuid::new_v4();
        let mut map = self.inner.write().await;
        map.sessions.insert(
            id,
            EditSession {
                catalog,
                last_result: None,
            },
        );
        map.order.push_back(id);
        while map.sessions.len() > self.max_sessions {
            let Some(oldest) = map.order.pop_front() else {
                break;
            };
            if map.sessions.remove(&oldest).is_some() {
                info!(session_id = %oldest, max_sessions = self.max_sessions, "edit session evicted");
            }
        }
        id
    }

    /// Returns `false` when no such session exists.
    pub async fn remove(&self, id: &Uuid) -> bool {
        let mut map = self.inner.write().await;
        if map.sessions.remove(id).is_none() {
            return false;
        }
        map.order.retain(|queued| queued != id);
        true
    }

    async fn catalog(&self, id: &Uuid) -> Option<BackgroundCatalog> {
        self.inner
            .read()
            .await
            .sessions
            .get(id)
            .map(|s| s.catalog.clone())
    }

    async fn replace_catalog(&self, id: &Uuid, catalog: BackgroundCatalog) -> bool {
        match self.inner.write().await.sessions.get_mut(id) {
            Some(session) => {
                session.catalog = catalog;
                true
            }
            None => false,
        }
    }

    async fn record_result(&self, id: &Uuid, result: SessionResult) -> bool {
        match self.inner.write().await.sessions.get_mut(id) {
            Some(session) => {
                session.last_result = Some(result);
                true
            }
            None => false,
        }
    }

    async fn last_result(&self, id: &Uuid) -> Option<Option<SessionResult>> {
        self.inner
            .read()
            .await
            .sessions
            .get(id)
            .map(|s| s.last_result.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditImageRequest {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SessionResponse {
    ok: bool,
    session_id: Uuid,
    backgrounds_dir: String,
    count: usize,
    backgrounds: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteSessionResponse {
    ok: bool,
    session_id: Uuid,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct BackgroundsResponse {
    ok: bool,
    session_id: Uuid,
    count: usize,
    backgrounds: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EditResponse<'a> {
    ok: bool,
    session_id: Uuid,
    #[serde(flatten)]
    result: &'a SessionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
}

pub async fn create_session_handler(State(state): State<AppState>) -> ApiObject<Value> {
    let dir = state.backgrounds_dir.clone();
    let scanned = tokio::task::spawn_blocking(move || BackgroundCatalog::scan(dir)).await;

    match scanned {
        Ok(Ok(catalog)) => {
            let backgrounds = catalog.entries().to_vec();
            let backgrounds_dir = catalog.dir().display().to_string();
            let session_id = state.sessions.insert(catalog).await;
            info!(%session_id, backgrounds = backgrounds.len(), "edit session created");
            (
                StatusCode::OK,
                into_json(SessionResponse {
                    ok: true,
                    session_id,
                    backgrounds_dir,
                    count: backgrounds.len(),
                    backgrounds,
                }),
            )
        }
        Ok(Err(error)) => internal_error(format!("background catalog scan failed: {error}")),
        Err(join_error) => internal_error(format!("session creation task failed: {join_error}")),
    }
}

pub async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiObject<Value> {
    let Some(session_id) = parse_session_id(session_id.as_str()) else {
        return not_found(SESSION_NOT_FOUND);
    };
    if !state.sessions.remove(&session_id).await {
        return not_found(SESSION_NOT_FOUND);
    }
    info!(%session_id, "edit session deleted");
    (
        StatusCode::OK,
        into_json(DeleteSessionResponse {
            ok: true,
            session_id,
            deleted: true,
        }),
    )
}

pub async fn list_backgrounds_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiObject<Value> {
    let Some(session_id) = parse_session_id(session_id.as_str()) else {
        return not_found(SESSION_NOT_FOUND);
    };
    match state.sessions.catalog(&session_id).await {
        Some(catalog) => backgrounds_response(session_id, &catalog),
        None => not_found(SESSION_NOT_FOUND),
    }
}

pub async fn refresh_backgrounds_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiObject<Value> {
    let Some(session_id) = parse_session_id(session_id.as_str()) else {
        return not_found(SESSION_NOT_FOUND);
    };
    let Some(mut catalog) = state.sessions.catalog(&session_id).await else {
        return not_found(SESSION_NOT_FOUND);
    };

    let refreshed = tokio::task::spawn_blocking(move || catalog.refresh().map(|_| catalog)).await;
    match refreshed {
        Ok(Ok(catalog)) => {
            if !state
                .sessions
                .replace_catalog(&session_id, catalog.clone())
                .await
            {
                return not_found(SESSION_NOT_FOUND);
            }
            backgrounds_response(session_id, &catalog)
        }
        Ok(Err(error)) => internal_error(format!("background catalog rescan failed: {error}")),
        Err(join_error) => internal_error(format!("catalog refresh task failed: {join_error}")),
    }
}

pub async fn edit_image_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<EditImageRequest>,
) -> ApiObject<Value> {
    let Some(session_id) = parse_session_id(session_id.as_str()) else {
        return not_found(SESSION_NOT_FOUND);
    };
    let Some(catalog) = state.sessions.catalog(&session_id).await else {
        return not_found(SESSION_NOT_FOUND);
    };

    let Some(instruction) = payload
        .instruction
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    else {
        return validation_error("Field 'instruction' is required");
    };
    let Some(encoded) = payload
        .image_base64
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    else {
        return validation_error("Field 'image_base64' is required");
    };
    let Ok(image_bytes) = decode_image_base64(encoded.as_str()) else {
        return validation_error("Field 'image_base64' must be valid base64");
    };

    let agent = state.agent.clone();
    let task_instruction = instruction.clone();
    let processed = tokio::task::spawn_blocking(move || {
        let mut outcome =
            agent.process(task_instruction.as_str(), image_bytes.as_slice(), &catalog);
        let png = encode_result_png(
            outcome.final_image.as_ref(),
            &mut outcome.execution_log,
            encode_png,
        );
        (outcome, png)
    })
    .await;

    let (outcome, png) = match processed {
        Ok(value) => value,
        Err(join_error) => return internal_error(format!("edit task failed: {join_error}")),
    };

    let result = SessionResult {
        instruction,
        plan: outcome.plan,
        plan_source: outcome.plan_source,
        planning_log: outcome.planning_log,
        execution_log: outcome.execution_log.into_entries(),
        success: png.is_some(),
        png,
    };
    let image_base64 = result.png.as_deref().map(|bytes| STANDARD.encode(bytes));
    let response = (
        StatusCode::OK,
        into_json(EditResponse {
            ok: true,
            session_id,
            result: &result,
            image_base64,
        }),
    );
    if !state.sessions.record_result(&session_id, result).await {
        return not_found(SESSION_NOT_FOUND);
    }
    response
}

pub async fn get_result_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiObject<Value> {
    let Some(session_id) = parse_session_id(session_id.as_str()) else {
        return not_found(SESSION_NOT_FOUND);
    };
    match state.sessions.last_result(&session_id).await {
        Some(Some(result)) => (
            StatusCode::OK,
            into_json(EditResponse {
                ok: true,
                session_id,
                result: &result,
                image_base64: None,
            }),
        ),
        Some(None) => not_found("No edit result for this session yet"),
        None => not_found(SESSION_NOT_FOUND),
    }
}

pub async fn download_result_png_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiObject<Value>> {
    let session_id =
        parse_session_id(session_id.as_str()).ok_or_else(|| not_found(SESSION_NOT_FOUND))?;
    let result = state
        .sessions
        .last_result(&session_id)
        .await
        .ok_or_else(|| not_found(SESSION_NOT_FOUND))?;
    let png = result
        .and_then(|r| r.png)
        .ok_or_else(|| not_found("No edited image for this session yet"))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, String::from("image/png")),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"edited_{session_id}.png\""),
            ),
        ],
        png,
    )
        .into_response())
}

fn backgrounds_response(session_id: Uuid, catalog: &BackgroundCatalog) -> ApiObject<Value> {
    (
        StatusCode::OK,
        into_json(BackgroundsResponse {
            ok: true,
            session_id,
            count: catalog.len(),
            backgrounds: catalog.entries().to_vec(),
        }),
    )
}

/// Encoding failures land in the execution log so a `success: false`
/// response always says why.
fn encode_result_png<E: Display>(
    image: Option<&RgbaImage>,
    log: &mut ExecutionLog,
    encode: impl FnOnce(&RgbaImage) -> Result<Vec<u8>, E>,
) -> Option<Vec<u8>> {
    match encode(image?) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            log.error(format!("Error encoding result image: {error}"));
            None
        }
    }
}

fn parse_session_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Accepts plain base64 or a `data:<mime>;base64,` URL.
fn decode_image_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    STANDARD.decode(payload.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_and_data_url_base64() {
        assert_eq!(
            decode_image_base64("aGVsbG8=").expect("plain base64"),
            b"hello".to_vec()
        );
        assert_eq!(
            decode_image_base64("data:image/png;base64,aGVsbG8=").expect("data url"),
            b"hello".to_vec()
        );
        assert!(decode_image_base64("not base64!").is_err());
    }

    #[test]
    fn session_ids_must_be_uuids() {
        assert!(parse_session_id("missing").is_none());
        let id = Uuid::new_v4();
        assert_eq!(parse_session_id(id.to_string().as_str()), Some(id));
    }

    #[tokio::test]
    async fn store_tracks_catalog_and_results_per_session() {
        let store = SessionStore::default();
        assert!(store.is_empty().await);
        let dir = std::env::temp_dir().join("backdrop_sessions_unit");
        let first = store
            .insert(BackgroundCatalog::from_entries(
                dir.as_path(),
                vec![String::from("bg1.png")],
            ))
            .await;
        let second = store
            .insert(BackgroundCatalog::empty(dir.as_path()))
            .await;
        assert_eq!(store.len().await, 2);

        assert_eq!(
            store.catalog(&first).await.expect("first session").entries(),
            &[String::from("bg1.png")][..]
        );
        assert!(store.catalog(&second).await.expect("second session").is_empty());
        assert_eq!(store.last_result(&first).await.map(|r| r.is_none()), Some(true));
        assert!(store.last_result(&Uuid::new_v4()).await.is_none());

        assert!(store.remove(&first).await);
        assert!(!store.remove(&first).await);
        assert!(store.catalog(&first).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn store_evicts_oldest_session_past_cap() {
        let store = SessionStore::bounded(2);
        let dir = std::env::temp_dir().join("backdrop_sessions_cap");
        let first = store.insert(BackgroundCatalog::empty(dir.as_path())).await;
        let second = store.insert(BackgroundCatalog::empty(dir.as_path())).await;
        assert!(store.remove(&second).await);
        let third = store.insert(BackgroundCatalog::empty(dir.as_path())).await;
        let fourth = store.insert(BackgroundCatalog::empty(dir.as_path())).await;

        assert_eq!(store.len().await, 2);
        assert!(store.catalog(&first).await.is_none());
        assert!(store.catalog(&third).await.is_some());
        assert!(store.catalog(&fourth).await.is_some());
        assert_eq!(SessionStore::bounded(0).max_sessions(), 1);
    }

    #[test]
    fn encode_failure_is_appended_to_execution_log() {
        let image = RgbaImage::new(2, 2);
        let mut log = ExecutionLog::default();

        let png = encode_result_png(Some(&image), &mut log, |_| Err("disk full"));
        assert!(png.is_none());
        assert_eq!(
            log.entries(),
            &[String::from("Error: Error encoding result image: disk full")][..]
        );

        let png = encode_result_png(Some(&image), &mut log, |_| Ok::<_, String>(vec![1, 2]));
        assert_eq!(png, Some(vec![1, 2]));
        assert!(encode_result_png(None, &mut log, |_| Ok::<_, String>(Vec::new())).is_none());
        assert_eq!(log.len(), 1);
    }
}
