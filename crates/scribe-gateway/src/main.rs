//! Scribe Gateway: upload-and-poll transcription jobs plus provider webhooks.
//!
//! Configuration comes from `config/scribe.toml` (or `SCRIBE_CONFIG`) overlaid with
//! `SCRIBE__*` environment variables; `.env` is loaded first.

mod handlers;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use scribe_core::{
    create_engine, FfmpegTrimmer, IngestionPipeline, JobRegistry, MediaLibrary, MemoryResultStore,
    ResultStore, ScribeConfig, ScribeResult, SledResultStore, Trimmer,
};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handlers::{jobs, webhook, ApiError, AppState};

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

fn build_state(config: ScribeConfig) -> ScribeResult<AppState> {
    let store: Arc<dyn ResultStore> = if config.uses_memory_store() {
        tracing::info!(target: "scribe::store", "using in-memory result store");
        Arc::new(MemoryResultStore::new())
    } else {
        let path = config.transcripts_db_path();
        tracing::info!(target: "scribe::store", "opening result store at {}", path.display());
        Arc::new(SledResultStore::open(path)?)
    };
    let registry = Arc::new(JobRegistry::new(store).with_job_timeout(config.job_timeout()));
    let engine = create_engine(&config.engine, &config.trim_program)?;
    let media = MediaLibrary::open(config.audio_dir())?;
    let trimmer: Arc<dyn Trimmer> = Arc::new(FfmpegTrimmer::new(config.trim_program.clone()));
    let pipeline = Arc::new(IngestionPipeline::from_config(&config, engine.clone())?);

    if config.api_token.as_deref().map_or(true, |t| t.trim().is_empty()) {
        tracing::warn!(target: "scribe::gateway", "api_token not set; job endpoints are open");
    }
    if config.webhook_secret.is_none() {
        tracing::warn!(target: "scribe::gateway", "webhook_secret not set; webhooks will be rejected");
    }

    Ok(AppState {
        config: Arc::new(config),
        registry,
        engine,
        media,
        trimmer,
        pipeline,
    })
}

/// Bearer-token gate for the job routes. Open when no `api_token` is configured.
async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = state
        .config
        .api_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(expected) = expected {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(str::trim);
        if provided != Some(expected) {
            return ApiError::new(StatusCode::UNAUTHORIZED, "Missing or invalid bearer token")
                .into_response();
        }
    }
    next.run(request).await
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let job_routes = Router::new()
        .route(
            "/transcribe",
            post(jobs::transcribe).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/transcriptions", get(jobs::list_transcriptions))
        .route(
            "/transcriptions/:id",
            get(jobs::get_transcription).delete(jobs::delete_transcription),
        )
        .route("/audio/:id", get(jobs::get_audio))
        .route("/status", get(jobs::status))
        .route("/stop-transcription", post(jobs::stop_transcription))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/", get(handlers::health))
        .route("/webhook/:provider", post(webhook::receive))
        .merge(job_routes)
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[scribe-gateway] .env not loaded: {} (using system environment)", e);
    }
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scribe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ScribeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(target: "scribe::gateway", "invalid configuration: {}", e.chain());
            std::process::exit(1);
        }
    };
    let addr = format!("{}:{}", config.host, config.port);
    let app_name = config.app_name.clone();

    let state = match build_state(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(target: "scribe::gateway", "startup failed: {}", e.chain());
            std::process::exit(1);
        }
    };
    tracing::info!(
        target: "scribe::gateway",
        "{} v{} using engine '{}'",
        app_name,
        scribe_core::version(),
        state.engine.name()
    );

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "scribe::gateway", "cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "scribe::gateway", "listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, build_app(state)).await {
        tracing::error!(target: "scribe::gateway", "server error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use scribe_core::webhook::{HttpFetcher, NoLookup, ResolutionChain};
    use scribe_core::{
        CancelToken, LogNotifier, PlaceholderEngine, ScribeError, Segment, SpeechEngine,
        Transcript,
    };
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "scribeboundary";

    /// Records trim calls; never touches the file.
    #[derive(Default)]
    struct RecordingTrimmer {
        calls: Mutex<Vec<(PathBuf, Option<String>, Option<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Trimmer for RecordingTrimmer {
        async fn trim(&self, path: &Path, start: Option<&str>, end: Option<&str>) -> ScribeResult<()> {
            self.calls.lock().unwrap().push((
                path.to_path_buf(),
                start.map(str::to_string),
                end.map(str::to_string),
            ));
            if self.fail {
                return Err(ScribeError::Trim("ffmpeg exited with status 1".into()));
            }
            Ok(())
        }
    }

    /// Emits one segment per step received on `gate`.
    struct SteppedEngine {
        texts: Vec<&'static str>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl SpeechEngine for SteppedEngine {
        fn name(&self) -> &str {
            "stepped"
        }
        fn transcribe(
            &self,
            _media: &Path,
            _language: Option<&str>,
            on_segment: &mut dyn FnMut(Segment),
            cancel: &CancelToken,
        ) -> ScribeResult<Transcript> {
            let gate = self.gate.lock().unwrap();
            let mut segments = Vec::new();
            for (i, text) in self.texts.iter().enumerate() {
                if gate.recv().is_err() || cancel.is_cancelled() {
                    return Err(ScribeError::Cancelled);
                }
                let seg = Segment::new(i as f64, i as f64 + 1.0, *text);
                on_segment(seg.clone());
                segments.push(seg);
            }
            Ok(Transcript::from_segments(segments))
        }
    }

    struct BrokenEngine;

    impl SpeechEngine for BrokenEngine {
        fn name(&self) -> &str {
            "broken"
        }
        fn transcribe(
            &self,
            _media: &Path,
            _language: Option<&str>,
            _on_segment: &mut dyn FnMut(Segment),
            _cancel: &CancelToken,
        ) -> ScribeResult<Transcript> {
            Err(ScribeError::Engine {
                message: "CUDA out of memory".into(),
                diagnostic: "allocating 2.1 GiB".into(),
            })
        }
    }

    fn test_config() -> ScribeConfig {
        ScribeConfig {
            app_name: "Test Scribe".to_string(),
            storage_path: ":memory:".to_string(),
            webhook_secret: Some("hook".to_string()),
            ..Default::default()
        }
    }

    fn test_state(
        config: ScribeConfig,
        engine: Arc<dyn SpeechEngine>,
        trimmer: Arc<RecordingTrimmer>,
        dir: &Path,
    ) -> AppState {
        let pipeline = IngestionPipeline::new(
            ResolutionChain::standard(Arc::new(NoLookup)),
            Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap()),
            engine.clone(),
            Arc::new(LogNotifier),
        )
        .with_temp_dir(dir);
        AppState {
            config: Arc::new(config),
            registry: Arc::new(JobRegistry::new(Arc::new(MemoryResultStore::new()))),
            engine,
            media: MediaLibrary::open(dir.join("audio")).unwrap(),
            trimmer,
            pipeline: Arc::new(pipeline),
        }
    }

    fn upload_request(file_name: &str, bytes: &[u8], fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/transcribe")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Poll until `done` accepts the response.
    async fn poll_until(
        app: &Router,
        uri: &str,
        done: impl Fn(StatusCode, &Value) -> bool,
    ) -> (StatusCode, Value) {
        for _ in 0..1000 {
            let (status, body) = send(app, get(uri)).await;
            if done(status, &body) {
                return (status, body);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached for {uri}");
    }

    #[tokio::test]
    async fn upload_streams_segments_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (step, gate) = mpsc::channel();
        let engine = Arc::new(SteppedEngine {
            texts: vec!["Guten Morgen", " zusammen ", "und willkommen"],
            gate: Mutex::new(gate),
        });
        let trimmer = Arc::new(RecordingTrimmer::default());
        let app = build_app(test_state(test_config(), engine, trimmer.clone(), dir.path()));

        let (status, body) = send(
            &app,
            upload_request("a.wav", b"RIFF----WAVE", &[("start", "0"), ("end", "5")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["transcriptionId"].as_str().unwrap().to_string();
        let uri = format!("/transcriptions/{id}");

        {
            let calls = trimmer.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].1.as_deref(), Some("0"));
            assert_eq!(calls[0].2.as_deref(), Some("5"));
        }

        let (status, body) = send(&app, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runningJobId"], id.as_str());
        assert_eq!(body["transcriptionInProgress"], true);

        let (status, body) = send(&app, upload_request("b.wav", b"RIFF", &[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("already running"));

        for expected in 1..=2 {
            step.send(()).unwrap();
            let (status, body) = poll_until(&app, &uri, |_, b| {
                b["segments"].as_array().map(Vec::len) == Some(expected)
            })
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
            assert_eq!(body["status"], "running");
        }
        let (_, body) = send(&app, get(&uri)).await;
        assert_eq!(body["text"], "Guten Morgen zusammen");

        step.send(()).unwrap();
        let (status, record) = poll_until(&app, &uri, |s, _| s == StatusCode::OK).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["chunks"].as_array().unwrap().len(), 3);
        assert_eq!(record["text"], "Guten Morgen zusammen und willkommen");
        assert_eq!(record["fileName"], "a.wav");
        assert!(record["transcriptionName"].as_str().unwrap().starts_with("a.wav - "));

        let (_, body) = send(&app, get("/status")).await;
        assert_eq!(body["runningJobId"], Value::Null);
        assert_eq!(body["status"], "idle");

        let (status, list) = send(&app, get("/transcriptions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let res = app.clone().oneshot(get(&format!("/audio/{id}"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"a.wav\""
        );
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"RIFF----WAVE");

        let ranged = Request::builder()
            .uri(format!("/audio/{id}"))
            .header(header::RANGE, "bytes=4-7")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(ranged).await.unwrap();
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"----");

        let delete = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, delete).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, get(&format!("/audio/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn engine_failure_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(
            test_config(),
            Arc::new(BrokenEngine),
            Arc::new(RecordingTrimmer::default()),
            dir.path(),
        ));
        let (status, _) = send(
            &app,
            upload_request("c.wav", b"RIFF", &[("transcriptionId", "job-c")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = poll_until(&app, "/transcriptions/job-c", |s, _| s != StatusCode::ACCEPTED).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "CUDA out of memory");
        assert_eq!(body["diagnostic"], "allocating 2.1 GiB");

        let (status, _) = send(&app, get("/transcriptions/job-c")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, list) = send(&app, get("/transcriptions")).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_settles_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let (step, gate) = mpsc::channel();
        let engine = Arc::new(SteppedEngine {
            texts: vec!["eins", "zwei", "drei"],
            gate: Mutex::new(gate),
        });
        let app = build_app(test_state(
            test_config(),
            engine,
            Arc::new(RecordingTrimmer::default()),
            dir.path(),
        ));

        let stop = || {
            Request::builder()
                .method("POST")
                .uri("/stop-transcription")
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(&app, stop()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(&app, upload_request("d.wav", b"RIFF", &[("transcriptionId", "job-d")])).await;
        step.send(()).unwrap();
        poll_until(&app, "/transcriptions/job-d", |_, b| {
            b["segments"].as_array().map(Vec::len) == Some(1)
        })
        .await;

        let (status, body) = send(&app, stop()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], "job-d");
        assert_eq!(body["status"], "succeeded");
        drop(step);

        let (status, record) = send(&app, get("/transcriptions/job-d")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["text"], "eins");
        let (_, body) = send(&app, get("/status")).await;
        assert_eq!(body["transcriptionInProgress"], false);
    }

    #[tokio::test]
    async fn upload_without_file_or_with_failed_trim_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trimmer = Arc::new(RecordingTrimmer {
            fail: true,
            ..Default::default()
        });
        let app = build_app(test_state(
            test_config(),
            Arc::new(PlaceholderEngine::new()),
            trimmer,
            dir.path(),
        ));

        let empty = Request::builder()
            .method("POST")
            .uri("/transcribe")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"start\"\r\n\r\n3\r\n--{BOUNDARY}--\r\n"
            )))
            .unwrap();
        let (status, body) = send(&app, empty).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file uploaded");

        let (status, _) = send(
            &app,
            upload_request("e.wav", b"RIFF", &[("transcriptionId", "job-e"), ("start", "1")]),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (_, body) = send(&app, get("/status")).await;
        assert_eq!(body["runningJobId"], Value::Null);
        let (status, _) = send(&app, get("/audio/job-e")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsafe_transcription_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trimmer = Arc::new(RecordingTrimmer::default());
        let app = build_app(test_state(
            test_config(),
            Arc::new(PlaceholderEngine::new()),
            trimmer.clone(),
            dir.path(),
        ));

        for id in ["..", "job.1", "a/b"] {
            let (status, body) = send(
                &app,
                upload_request("f.wav", b"RIFF", &[("transcriptionId", id)]),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{id}");
            assert!(body["error"].as_str().unwrap().contains("job id"));
        }
        assert!(trimmer.calls.lock().unwrap().is_empty());
        let (_, body) = send(&app, get("/status")).await;
        assert_eq!(body["runningJobId"], Value::Null);

        let (status, _) = send(&app, get("/audio/job.1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejected_upload_leaves_running_media_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (step, gate) = mpsc::channel();
        let engine = Arc::new(SteppedEngine {
            texts: vec!["eins"],
            gate: Mutex::new(gate),
        });
        let app = build_app(test_state(
            test_config(),
            engine,
            Arc::new(RecordingTrimmer::default()),
            dir.path(),
        ));

        let (status, _) = send(
            &app,
            upload_request("g.wav", b"ORIGINAL", &[("transcriptionId", "job-g")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            upload_request("g2.wav", b"REPLACED", &[("transcriptionId", "job-g")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let res = app.clone().oneshot(get("/audio/job-g")).await.unwrap();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ORIGINAL");

        // No staged leftovers next to the committed file.
        assert_eq!(std::fs::read_dir(dir.path().join("audio")).unwrap().count(), 1);
        step.send(()).unwrap();
        poll_until(&app, "/transcriptions/job-g", |s, _| s == StatusCode::OK).await;
    }

    #[tokio::test]
    async fn bearer_token_guards_job_routes_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScribeConfig {
            api_token: Some("secret-token".to_string()),
            ..test_config()
        };
        let app = build_app(test_state(
            config,
            Arc::new(PlaceholderEngine::new()),
            Arc::new(RecordingTrimmer::default()),
            dir.path(),
        ));

        let (status, _) = send(&app, get("/status")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let authed = Request::builder()
            .uri("/status")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, authed).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["engine"], "placeholder");
    }

    #[tokio::test]
    async fn webhook_checks_secret_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(
            test_config(),
            Arc::new(PlaceholderEngine::new()),
            Arc::new(RecordingTrimmer::default()),
            dir.path(),
        ));
        let hook = |secret: Option<&str>, body: &str| {
            let mut req = Request::builder()
                .method("POST")
                .uri("/webhook/streamio")
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(secret) = secret {
                req = req.header(webhook::SECRET_HEADER, secret);
            }
            req.body(Body::from(body.to_string())).unwrap()
        };

        let (status, _) = send(&app, hook(None, "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, hook(Some("nope"), "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, hook(Some("hook"), "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, hook(Some("hook"), r#"{"event":"started","object_id":"x"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert_eq!(body["scheduled"], false);

        let ready = r#"{"event":"completed","object_type":"recording","object_id":"r1","object_data":{}}"#;
        let (status, body) = send(&app, hook(Some("hook"), ready)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduled"], true);
    }
}
