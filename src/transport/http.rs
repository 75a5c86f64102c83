//! HTTP admin surface.
//!
//! JSON in, JSON out. The session is identified by the `X-Session-ID`
//! header or the `session_id` query parameter; the header wins. When an
//! API key is configured, every route requires `Authorization: Bearer`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use super::{SessionRegistry, ws};
use crate::executor::{ExecutorError, TurnOutcome};

pub(crate) type AppState = Arc<SessionRegistry>;

/// Build the full router: admin routes plus the WebSocket endpoint.
#[must_use]
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route(
            "/api/sessions/{id}",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .route("/api/chat", post(chat))
        .route("/api/history", get(history))
        .route("/api/clear", post(clear_session))
        .route("/api/status", get(status))
        .route("/api/sync", post(sync))
        .route("/api/memory/search", post(memory_search))
        .route("/api/memory/stats", get(memory_stats))
        .route("/api/memory/summarize", post(memory_summarize))
        .route("/api/tasks/status", get(tasks_status))
        .route("/api/tasks/resume", post(tasks_resume))
        .route("/api/tasks/abandon", post(tasks_abandon))
        .with_state(registry)
}

// ---------------------------------------------------------------------------
// Error plumbing
// ---------------------------------------------------------------------------

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid API key")
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Busy => ApiError::bad_request("busy"),
            other => {
                error!(error = %other, "turn failed");
                ApiError::internal(other.to_string())
            }
        }
    }
}

fn internal<E: std::fmt::Display>(err: E) -> ApiError {
    error!(error = %err, "admin request failed");
    ApiError::internal(err.to_string())
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemorySearchBody {
    query: String,
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResumeBody {
    feedback: String,
    #[serde(default = "default_true")]
    approved: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.services().config.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

/// Header beats query parameter.
pub(crate) fn session_id_from(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get("x-session-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| query.session_id.clone())
}

fn require_session_id(headers: &HeaderMap, query: &SessionQuery) -> Result<String, ApiError> {
    session_id_from(headers, query)
        .ok_or_else(|| ApiError::bad_request("missing session id (X-Session-ID or session_id)"))
}

// ---------------------------------------------------------------------------
// Session CRUD
// ---------------------------------------------------------------------------

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = state.mint_session_id();
    // The body is optional; tolerate both absence and `{}`.
    let parsed: Option<CreateSessionBody> = serde_json::from_slice(&body).ok();
    let title = parsed.as_ref().and_then(|b| b.title.as_deref());
    let record = state
        .services()
        .archive
        .ensure_session(&session_id, title)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(record).map_err(internal)?))
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let sessions = state.services().archive.sessions().await.map_err(internal)?;
    Ok(Json(json!({"sessions": sessions})))
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session = state
        .services()
        .archive
        .session(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("unknown session: {id}")))?;
    Ok(Json(serde_json::to_value(session).map_err(internal)?))
}

async fn rename_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let renamed = state
        .services()
        .archive
        .rename_session(&id, &body.title)
        .await
        .map_err(internal)?;
    if !renamed {
        return Err(ApiError::not_found(format!("unknown session: {id}")));
    }
    Ok(Json(json!({"ok": true, "title": body.title})))
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    if let Some(runtime) = state.get(&id).await {
        let _ = runtime.memory.clear_session().await;
    }
    state.remove(&id).await;
    state.services().log.clear(&id).await.map_err(internal)?;
    let deleted = state
        .services()
        .archive
        .delete_session(&id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found(format!("unknown session: {id}")));
    }
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Chat & history
// ---------------------------------------------------------------------------

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("empty message"));
    }
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    match runtime.executor.process_message(&body.message, vec![]).await? {
        TurnOutcome::Complete { response } => Ok(Json(json!({"response": response}))),
        TurnOutcome::Checkpoint { task } => {
            let message = task.checkpoint_message.clone();
            Ok(Json(json!({"checkpoint": task, "message": message})))
        }
    }
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    // Surface everything accepted so far, including the unflushed tail.
    if let Some(runtime) = state.get(&session_id).await {
        runtime.coordinator.sync().await.map_err(internal)?;
    }
    let messages = state
        .services()
        .archive
        .messages(&session_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"messages": messages})))
}

async fn clear_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    if let Some(runtime) = state.get(&session_id).await {
        runtime.memory.clear_session().await.map_err(internal)?;
    }
    state.services().log.clear(&session_id).await.map_err(internal)?;
    // Drop the runtime so the next turn starts from the cleared stores.
    state.remove(&session_id).await;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    let board = runtime
        .orchestrator
        .board_snapshot()
        .await
        .map_err(internal)?;
    let events = runtime.bus.metrics();
    Ok(Json(json!({
        "sessionId": session_id,
        "coordinator": runtime.coordinator.metrics(),
        "circuitBreaker": runtime.gateway.breaker_state(),
        "board": board.map(|b| json!({
            "id": b.id,
            "status": b.status,
            "progress": b.progress_percent(),
            "tasks": b.tasks.len(),
        })),
        "events": {"capacity": events.capacity, "dropped": events.dropped},
    })))
}

async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    runtime.coordinator.sync().await.map_err(internal)?;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

async fn memory_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(body): Json<MemorySearchBody>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    let results = runtime
        .memory
        .search_short_term(&body.query, body.top_k.unwrap_or(5))
        .await
        .map_err(internal)?;
    Ok(Json(json!({"results": results})))
}

async fn memory_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    let stats = runtime.memory.stats().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(stats).map_err(internal)?))
}

async fn memory_summarize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    runtime.coordinator.sync().await.map_err(internal)?;
    let rows = state
        .services()
        .archive
        .messages(&session_id)
        .await
        .map_err(internal)?;
    let messages: Vec<crate::message::Message> = rows
        .iter()
        .map(|row| crate::message::Message::text(&row.session_id, row.role, &row.content))
        .collect();
    let summary = runtime
        .memory
        .summarize_conversation(&messages)
        .await
        .map_err(internal)?;
    let topics = runtime
        .memory
        .extract_topics(&summary)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"summary": summary, "topics": topics})))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn tasks_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    let context = runtime
        .orchestrator
        .session_context()
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(context).map_err(internal)?))
}

async fn tasks_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(body): Json<ResumeBody>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    let outcome = runtime
        .orchestrator
        .resume_from_checkpoint(&body.feedback, body.approved)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(match outcome {
        crate::orchestrator::ExecutionOutcome::Completed { final_output } => {
            json!({"status": "completed", "response": final_output})
        }
        crate::orchestrator::ExecutionOutcome::Checkpoint { task } => {
            json!({"status": "checkpoint", "task": task})
        }
        crate::orchestrator::ExecutionOutcome::Failed { message } => {
            json!({"status": "failed", "message": message})
        }
    }))
}

async fn tasks_abandon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let session_id = require_session_id(&headers, &query)?;
    let runtime = state.get_or_create(&session_id).await;
    runtime.orchestrator.abandon().await.map_err(internal)?;
    Ok(Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_beats_query_for_session_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "from-header".parse().unwrap());
        let query = SessionQuery {
            session_id: Some("from-query".into()),
        };
        assert_eq!(
            session_id_from(&headers, &query),
            Some("from-header".to_string())
        );
        assert_eq!(
            session_id_from(&HeaderMap::new(), &query),
            Some("from-query".to_string())
        );
        assert_eq!(
            session_id_from(&HeaderMap::new(), &SessionQuery::default()),
            None
        );
    }
}
