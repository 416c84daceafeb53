//! Inbound HTTP surface: webhook callbacks and snapshot file retrieval.
//!
//! Webhook handlers verify the shared secret, enqueue a processing task,
//! and return immediately. GitLab treats slow hook endpoints as broken,
//! so no handler does any real work inline.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::import::snapshot;
use crate::queue::TaskQueue;
use crate::tasks::Task;

#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
}

pub fn router(queue: TaskQueue) -> Router {
    let state = Arc::new(AppState { queue });
    Router::new()
        .route("/hook/{server_id}", post(system_hook))
        .route("/hook/{server_id}/{repo_id}/{project_id}", post(project_hook))
        .route(
            "/internal/retrieve/{schema}/{commit}/{file_type}/{*path}",
            get(retrieve_file),
        )
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
        warn!("request failed: {self}");
        (status, self.to_string()).into_response()
    }
}

fn hook_token(headers: &HeaderMap) -> &str {
    headers
        .get("x-gitlab-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn system_hook(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<i64>,
    headers: HeaderMap,
    axum::Json(payload): axum::Json<Value>,
) -> Result<StatusCode, Error> {
    state
        .queue
        .hooks()
        .verify_hook_secret(server_id, hook_token(&headers))?;
    state
        .queue
        .add(Task::ProcessSystemHookEvent { server_id, payload });
    Ok(StatusCode::OK)
}

async fn project_hook(
    State(state): State<Arc<AppState>>,
    Path((server_id, repo_id, project_id)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
    axum::Json(payload): axum::Json<Value>,
) -> Result<StatusCode, Error> {
    state
        .queue
        .hooks()
        .verify_hook_secret(server_id, hook_token(&headers))?;
    state.queue.add(Task::ProcessProjectHookEvent {
        repo_id,
        project_id,
        payload,
    });
    Ok(StatusCode::OK)
}

async fn retrieve_file(
    State(state): State<Arc<AppState>>,
    Path((schema, commit, file_type, path)): Path<(String, String, String, String)>,
) -> Result<Vec<u8>, Error> {
    snapshot::retrieve_snapshot_file(
        state.queue.store().as_ref(),
        state.queue.gitlab().as_ref(),
        &schema,
        &commit,
        &file_type,
        &path,
    )
    .await
}
