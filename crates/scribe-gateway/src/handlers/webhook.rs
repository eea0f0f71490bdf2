//! Provider webhooks. Authenticated by a shared secret header, not the bearer token.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use scribe_core::WebhookEvent;
use serde_json::{json, Value};

use super::{ApiError, ApiResult, AppState};

pub const SECRET_HEADER: &str = "x-webhook-secret";

fn verify_secret(expected: Option<&str>, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Webhooks are disabled: no webhook_secret configured",
        ));
    };
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if provided != Some(expected) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Missing or invalid webhook secret"));
    }
    Ok(())
}

/// POST /webhook/:provider: acknowledge immediately, process out of band.
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    verify_secret(state.config.webhook_secret.as_deref(), &headers)?;
    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid webhook payload: {e}")))?;

    tracing::info!(
        target: "scribe::webhook",
        "{} webhook: '{}' for {} {}",
        provider,
        event.event_type,
        event.object_type.as_deref().unwrap_or("object"),
        event.object_id().unwrap_or("-")
    );
    let scheduled = state.pipeline.handle_event(event).is_some();
    Ok(Json(json!({ "received": true, "scheduled": scheduled })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_must_match_and_be_configured() {
        let mut headers = HeaderMap::new();
        assert!(verify_secret(None, &headers).is_err());
        assert!(verify_secret(Some("s3cret"), &headers).is_err());
        headers.insert(SECRET_HEADER, HeaderValue::from_static("wrong"));
        assert!(verify_secret(Some("s3cret"), &headers).is_err());
        headers.insert(SECRET_HEADER, HeaderValue::from_static(" s3cret "));
        assert!(verify_secret(Some("s3cret"), &headers).is_ok());
    }
}
