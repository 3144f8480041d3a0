use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use termhub_protocol::{HistoryRecord, NotificationRequest, SessionInfo};
use thiserror::Error;

use super::AppState;
use crate::multiplexer::NotifyOutcome;
use crate::session::SessionError;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Errors returned by the REST routes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let (error, message) = match self {
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::NotFound(msg) => ("not_found", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::Internal(msg) => ("internal", msg),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::NotFound(format!("session {id} not found")),
            SessionError::LimitReached(max) => {
                ApiError::Conflict(format!("session limit of {max} reached"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub working_directory: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

/// Acknowledgement returned for every notification.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyAck {
    pub success: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.mux.session_count().await,
    })
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.mux.list_sessions().await)
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let dir = request.working_directory.trim();
    if dir.is_empty() {
        return Err(ApiError::BadRequest(
            "workingDirectory must not be empty".to_string(),
        ));
    }

    match state.mux.create_session(dir).await {
        Ok(session) => Ok((StatusCode::CREATED, Json(session))),
        Err(e) => {
            tracing::warn!(working_directory = %dir, error = %e, "Failed to create session");
            Err(e.into())
        }
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionInfo> {
    state
        .mux
        .get_session(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| SessionError::NotFound(session_id).into())
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.mux.delete_session(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SessionError::NotFound(session_id).into())
    }
}

pub async fn session_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<String, ApiError> {
    state
        .mux
        .session_output(&session_id)
        .await
        .ok_or_else(|| SessionError::NotFound(session_id).into())
}

pub async fn get_history(State(state): State<AppState>) -> Json<Vec<HistoryRecord>> {
    Json(state.mux.history().get_history())
}

pub async fn clear_history(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .mux
        .history()
        .clear_history()
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Notification intake. Always acknowledged, matched or not.
pub async fn notify(
    State(state): State<AppState>,
    Json(request): Json<NotificationRequest>,
) -> Json<NotifyAck> {
    if let NotifyOutcome::Applied { session } = state.mux.notify(request).await {
        tracing::debug!(session_id = %session.id, status = %session.status, "Notification applied");
    }
    Json(NotifyAck { success: true })
}
