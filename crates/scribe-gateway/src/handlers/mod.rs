//! HTTP handlers and the state they share.

pub mod jobs;
pub mod webhook;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scribe_core::{
    IngestionPipeline, JobRegistry, MediaLibrary, ScribeConfig, ScribeError, SpeechEngine, Trimmer,
};
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ScribeConfig>,
    pub registry: Arc<JobRegistry>,
    pub engine: Arc<dyn SpeechEngine>,
    pub media: MediaLibrary,
    pub trimmer: Arc<dyn Trimmer>,
    pub pipeline: Arc<IngestionPipeline>,
}

/// Error response: `{"error": "..."}` with a status picked from the error kind.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<ScribeError> for ApiError {
    fn from(err: ScribeError) -> Self {
        let status = match &err {
            ScribeError::Busy { .. } | ScribeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ScribeError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(target: "scribe::gateway", "{}", err.chain());
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// GET / (unauthenticated): liveness plus the loaded engine.
pub async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "app": state.config.app_name,
        "version": scribe_core::version(),
        "engine": state.engine.name(),
        "transcriptionInProgress": state.registry.status().running_job_id.is_some(),
    }))
}
