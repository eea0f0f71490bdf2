//! Upload, poll, list, delete and stop for single-flight transcription jobs.

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use scribe_core::{launch_job, validate_job_id, JobStatus, JobView, ScribeError};
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use uuid::Uuid;

use super::{ApiError, ApiResult, AppState};

struct Upload {
    file_name: String,
    bytes: Bytes,
    start: Option<String>,
    end: Option<String>,
    job_id: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<Upload> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        ApiError::bad_request(format!("Invalid multipart body: {e}"))
    };
    let mut file = None;
    let mut start = None;
    let mut end = None;
    let mut job_id = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                file = Some((file_name, field.bytes().await.map_err(invalid)?));
            }
            "start" => start = Some(field.text().await.map_err(invalid)?),
            "end" => end = Some(field.text().await.map_err(invalid)?),
            "transcriptionId" => job_id = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }

    let Some((file_name, bytes)) = file else {
        return Err(ApiError::bad_request("No file uploaded"));
    };
    if bytes.is_empty() {
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }
    let job_id = job_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    if let Some(id) = job_id.as_deref() {
        validate_job_id(id)?;
    }
    Ok(Upload {
        file_name,
        bytes,
        start,
        end,
        job_id,
    })
}

/// POST /transcribe: stage, trim, claim the slot, move the media into place, start
/// the worker. Returns at once. The upload stays staged until the slot is ours, so a
/// rejected request never touches the media of a running job.
pub async fn transcribe(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    if let Some(running) = state.registry.status().running_job_id {
        return Err(ScribeError::Busy { running }.into());
    }
    let upload = read_upload(multipart).await?;
    let job_id = upload
        .job_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let staged = state.media.stage(&upload.bytes).await?;
    state
        .trimmer
        .trim(staged.path(), upload.start.as_deref(), upload.end.as_deref())
        .await?;

    let ticket = state.registry.try_start(&job_id, &upload.file_name)?;
    let path = match state.media.commit(&job_id, staged) {
        Ok(path) => path,
        Err(e) => {
            ticket.sender.error("Could not store upload", e.chain());
            state.registry.reconcile(&job_id)?;
            return Err(e.into());
        }
    };
    launch_job(
        state.registry.clone(),
        state.engine.clone(),
        ticket,
        path,
        state.config.upload_language(),
    );
    tracing::info!(target: "scribe::gateway", "accepted {} as job {}", upload.file_name, job_id);
    Ok(Json(json!({ "transcriptionId": job_id })))
}

fn running_response(view: JobView) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "running",
            "transcriptionId": view.id,
            "fileName": view.file_name,
            "text": view.text,
            "segments": view.segments,
        })),
    )
        .into_response()
}

fn failed_response(view: JobView) -> Response {
    let (error, diagnostic) = view
        .error
        .map(|e| (e.message, e.diagnostic))
        .unwrap_or_else(|| ("Transcription failed".to_string(), String::new()));
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": "error",
            "transcriptionId": view.id,
            "error": error,
            "diagnostic": diagnostic,
            "text": view.text,
            "segments": view.segments,
        })),
    )
        .into_response()
}

/// GET /transcriptions/:id: drains the active job, otherwise reads the store.
pub async fn get_transcription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.registry.drain(&id)? {
        Some(view) if view.status == JobStatus::Running => return Ok(running_response(view)),
        Some(view) if view.status == JobStatus::Failed => return Ok(failed_response(view)),
        _ => {}
    }
    match state.registry.store().get(&id)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ScribeError::NotFound(format!("Transcription {id}")).into()),
    }
}

/// GET /transcriptions
pub async fn list_transcriptions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let records = state.registry.store().list()?;
    Ok(Json(json!(records)))
}

/// DELETE /transcriptions/:id: removes the record and its media.
pub async fn delete_transcription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    validate_job_id(&id)?;
    if state.registry.is_running(&id) {
        return Err(ScribeError::Busy { running: id }.into());
    }
    let record_removed = state.registry.store().remove(&id)?;
    let media_removed = state.media.remove(&id).await?;
    if !record_removed && !media_removed {
        return Err(ScribeError::NotFound(format!("Transcription {id}")).into());
    }
    tracing::info!(target: "scribe::gateway", "deleted transcription {}", id);
    Ok(Json(json!({ "deleted": id })))
}

/// Header-safe download name: printable ASCII without quotes, else the job id.
fn attachment_name(file_name: &str, id: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && *c != '"' && *c != '\\')
        .collect();
    if cleaned.trim().is_empty() {
        id.to_string()
    } else {
        cleaned
    }
}

/// GET /audio/:id: streamed from disk, with range support.
pub async fn get_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    let path = state
        .media
        .find(&id)?
        .ok_or_else(|| ScribeError::NotFound(format!("Audio {id}")))?;
    let file_name = state
        .registry
        .store()
        .get(&id)
        .ok()
        .flatten()
        .map(|r| r.file_name)
        .unwrap_or_else(|| id.clone());

    let mut response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    };
    if response.status().is_success() {
        let disposition = format!("inline; filename=\"{}\"", attachment_name(&file_name, &id));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let running = state.registry.status().running_job_id;
    Json(json!({
        "status": if running.is_some() { "running" } else { "idle" },
        "runningJobId": running,
        "transcriptionInProgress": running.is_some(),
    }))
}

/// POST /stop-transcription: stop the active job and settle it right away.
pub async fn stop_transcription(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let job_id = match state.registry.request_stop_active() {
        Ok(id) => id,
        Err(ScribeError::NotFound(_)) => {
            return Err(ApiError::bad_request("No transcription running"));
        }
        Err(e) => return Err(e.into()),
    };
    let status = state.registry.reconcile(&job_id)?;
    Ok(Json(json!({ "stopped": job_id, "status": status })))
}
