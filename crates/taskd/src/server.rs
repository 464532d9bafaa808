//! HTTP control plane for taskd.
//!
//! Local-only REST API over the task store plus an SSE stream of task events.
//! When a token is configured every route except `/health` requires
//! `Authorization: Bearer <token>`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use task_core::{Id, MergeResolution, Task, TaskMode};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::git::GitError;
use crate::locks::LockError;
use crate::runner::RunnerError;
use crate::store::{NewTask, StoreError, TaskStore};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub auth_token: Option<String>,
    /// Resolution used when a merge request does not name one.
    pub default_resolution: MergeResolution,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/commit", post(commit_task))
        .route("/tasks/{id}/request-changes", post(request_changes))
        .route("/tasks/{id}/preview/start", post(start_preview))
        .route("/tasks/{id}/preview/stop", post(stop_preview))
        .route("/tasks/{id}/merge", post(merge_task))
        .route("/tasks/{id}/prompt", post(send_prompt))
        .route("/admin/merge-lock/clear", post(clear_merge_lock))
        .route("/events", get(stream_events))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on 127.0.0.1 until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            branch: None,
            paths: None,
        }),
    )
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));
    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn parse_id(raw: &str) -> ApiResult<Id> {
    Id::parse(raw).map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Validation(_)
        | StoreError::Git(GitError::InvalidPath(_) | GitError::NotARepo(_)) => {
            StatusCode::BAD_REQUEST
        }
        StoreError::InvalidState { .. }
        | StoreError::Busy(_)
        | StoreError::NoCommit(_)
        | StoreError::PreviewActive(_)
        | StoreError::NoPreview(_)
        | StoreError::MergeInProgress(_)
        | StoreError::Transition(_)
        | StoreError::Git(GitError::Conflict { .. } | GitError::DirtyWorkingTree(_))
        | StoreError::Lock(LockError::MergeInProgress(_))
        | StoreError::Runner(RunnerError::AlreadyRunning(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a store error to a response, logging server-side failures.
fn store_error(action: &str, err: StoreError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(action, error = %err, "request failed");
    } else {
        warn!(action, error = %err, "request rejected");
    }
    let (branch, paths) = match &err {
        StoreError::Git(GitError::Conflict { branch, paths }) => {
            (Some(branch.clone()), Some(paths.clone()))
        }
        _ => (None, None),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            branch,
            paths,
        }),
    )
}

// --- Request/Response types ---

/// Error response body. Conflicts name the branch and conflicting paths.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Request payload for POST /tasks.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    pub repo_path: String,
    #[serde(default)]
    pub mode: Option<TaskMode>,
    #[serde(default)]
    pub image_path: Option<String>,
    /// Launch the phase pipeline right away.
    #[serde(default = "default_true")]
    pub start: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub repo_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CommitRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub commit: String,
}

/// Body for request-changes and follow-up prompts.
#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct MergeRequest {
    #[serde(default)]
    pub resolution: Option<MergeResolution>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearMergeLockResponse {
    pub cleared: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    /// Only stream events for this task.
    #[serde(default)]
    pub task_id: Option<String>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /tasks
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let request = NewTask {
        prompt: req.prompt,
        repo_path: PathBuf::from(req.repo_path),
        mode: req.mode.unwrap_or_default(),
        image_path: req.image_path.map(PathBuf::from),
    };
    let mut task = state
        .store
        .create(request)
        .await
        .map_err(|e| store_error("create", e))?;
    if req.start {
        task = state
            .store
            .start(&task.id)
            .await
            .map_err(|e| store_error("start", e))?;
    }
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /tasks
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let mut tasks = state.store.list();
    if let Some(status) = &query.status {
        tasks.retain(|t| t.status().as_str().eq_ignore_ascii_case(status));
    }
    if let Some(repo) = &query.repo_path {
        tasks.retain(|t| &t.repo_path == repo);
    }
    Ok(Json(ListTasksResponse { tasks }))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state.store.get(&id).map_err(|e| store_error("get", e))?;
    Ok(Json(TaskResponse { task }))
}

/// DELETE /tasks/{id}
async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    state
        .store
        .remove(&id)
        .await
        .map_err(|e| store_error("delete", e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tasks/{id}/start
async fn start_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state
        .store
        .start(&id)
        .await
        .map_err(|e| store_error("start", e))?;
    Ok(Json(TaskResponse { task }))
}

/// POST /tasks/{id}/commit
async fn commit_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<CommitRequest>>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let message = body.and_then(|Json(b)| b.message);
    let commit = state
        .store
        .commit(&id, message.as_deref())
        .await
        .map_err(|e| store_error("commit", e))?;
    Ok(Json(CommitResponse { commit }))
}

/// POST /tasks/{id}/request-changes
async fn request_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TextRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state
        .store
        .request_changes(&id, &req.text)
        .await
        .map_err(|e| store_error("request changes", e))?;
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// POST /tasks/{id}/preview/start
async fn start_preview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state
        .store
        .start_preview(&id)
        .await
        .map_err(|e| store_error("start preview", e))?;
    Ok(Json(TaskResponse { task }))
}

/// POST /tasks/{id}/preview/stop
async fn stop_preview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state
        .store
        .stop_preview(&id)
        .await
        .map_err(|e| store_error("stop preview", e))?;
    Ok(Json(TaskResponse { task }))
}

/// POST /tasks/{id}/merge
async fn merge_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<MergeRequest>>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let resolution = body
        .and_then(|Json(b)| b.resolution)
        .unwrap_or(state.default_resolution);
    let task = state
        .store
        .merge(&id, resolution)
        .await
        .map_err(|e| store_error("merge", e))?;
    Ok(Json(TaskResponse { task }))
}

/// POST /tasks/{id}/prompt
async fn send_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TextRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let task = state
        .store
        .send_prompt(&id, &req.text)
        .await
        .map_err(|e| store_error("prompt", e))?;
    Ok(Json(TaskResponse { task }))
}

/// POST /admin/merge-lock/clear
async fn clear_merge_lock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let cleared = state.store.merge_lock().force_clear();
    Ok(Json(ClearMergeLockResponse { cleared }))
}

/// GET /events - task events as Server-Sent Events.
///
/// The SSE event name is the event type; the data is the JSON event.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    check_auth(&state, &headers)?;
    let filter = query.task_id.as_deref().map(parse_id).transpose()?;

    let rx = state.store.subscribe();
    let stream = stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.as_ref().is_some_and(|id| id != event.task_id()) {
                        continue;
                    }
                    let data = match event.to_json() {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    let sse = SseEvent::default()
                        .event(event.event_type().as_str())
                        .data(data);
                    return Some((Ok(sse), (rx, filter)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
