//! **Speech engine adapter** — turns a media file into timestamped segments.
//!
//! Implement [`SpeechEngine`] for local Whisper (whisper-rs) or a remote
//! OpenAI-compatible transcription API. Engines push each segment into the caller's sink
//! as soon as it exists and poll the [`CancelToken`] between segments.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{ScribeError, ScribeResult};

/// One timestamped span of recognized speech. Times are seconds from media start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Full engine result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Text is the space-joined concatenation of trimmed segment texts.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let mut text = String::new();
        for seg in &segments {
            append_text(&mut text, &seg.text);
        }
        Self { text, segments }
    }
}

/// Append `piece` (trimmed) to `acc`, separated by one space. Empty pieces are skipped.
pub fn append_text(acc: &mut String, piece: &str) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    if !acc.is_empty() {
        acc.push(' ');
    }
    acc.push_str(piece);
}

/// Shared stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backend that converts a media file to text. Calls block; run them off the async runtime.
pub trait SpeechEngine: Send + Sync {
    /// Short identifier for logs and the liveness probe.
    fn name(&self) -> &str;

    /// Transcribe `media`. `language` of `None` asks the engine to auto-detect.
    /// Every segment is handed to `on_segment` in order before this returns.
    fn transcribe(
        &self,
        media: &Path,
        language: Option<&str>,
        on_segment: &mut dyn FnMut(Segment),
        cancel: &CancelToken,
    ) -> ScribeResult<Transcript>;
}

/// Synchronous, non-streaming call used by the webhook path.
pub fn transcribe_file(
    engine: &dyn SpeechEngine,
    media: &Path,
    language: Option<&str>,
) -> ScribeResult<Transcript> {
    engine.transcribe(media, language, &mut |_| {}, &CancelToken::new())
}

/// Placeholder engine: emits fixed segments. Use for running the gateway without a model.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderEngine {
    /// If set, emit these instead of the default single segment.
    pub segments: Option<Vec<Segment>>,
}

impl PlaceholderEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segments(segments: Vec<Segment>) -> Self {
        Self {
            segments: Some(segments),
        }
    }
}

impl SpeechEngine for PlaceholderEngine {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn transcribe(
        &self,
        media: &Path,
        _language: Option<&str>,
        on_segment: &mut dyn FnMut(Segment),
        cancel: &CancelToken,
    ) -> ScribeResult<Transcript> {
        let segments = self.segments.clone().unwrap_or_else(|| {
            let name = media
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            vec![Segment::new(
                0.0,
                1.0,
                format!("[placeholder transcript for {} - configure a speech engine]", name),
            )]
        });
        let mut emitted = Vec::with_capacity(segments.len());
        for seg in segments {
            if cancel.is_cancelled() {
                return Err(ScribeError::Cancelled);
            }
            on_segment(seg.clone());
            emitted.push(seg);
        }
        Ok(Transcript::from_segments(emitted))
    }
}

/// Remote engine: OpenAI-compatible `/audio/transcriptions` with `verbose_json` segments.
#[derive(Debug, Clone)]
pub struct RemoteEngine {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

impl RemoteEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl SpeechEngine for RemoteEngine {
    fn name(&self) -> &str {
        "remote"
    }

    fn transcribe(
        &self,
        media: &Path,
        language: Option<&str>,
        on_segment: &mut dyn FnMut(Segment),
        cancel: &CancelToken,
    ) -> ScribeResult<Transcript> {
        // Blocking client is built here: engine calls always run on a blocking thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ScribeError::engine(e.to_string()))?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let mut form = reqwest::blocking::multipart::Form::new()
            .file("file", media)?
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }
        let res = client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| ScribeError::engine(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(ScribeError::Engine {
                message: format!("STT API error {}", status),
                diagnostic: body,
            });
        }
        let parsed: VerboseTranscription =
            res.json().map_err(|e| ScribeError::engine(e.to_string()))?;

        if parsed.segments.is_empty() && !parsed.text.trim().is_empty() {
            let seg = Segment::new(0.0, 0.0, parsed.text.trim());
            on_segment(seg.clone());
            return Ok(Transcript::from_segments(vec![seg]));
        }
        let mut emitted = Vec::with_capacity(parsed.segments.len());
        for seg in parsed.segments {
            if cancel.is_cancelled() {
                return Err(ScribeError::Cancelled);
            }
            on_segment(seg.clone());
            emitted.push(seg);
        }
        Ok(Transcript::from_segments(emitted))
    }
}

// -----------------------------------------------------------------------------
// Local Whisper engine (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_engine {
    use super::*;
    use crate::media::decode_pcm_f32;
    use std::path::PathBuf;
    use whisper_rs::{
        FullParams, SamplingStrategy, SegmentCallbackData, WhisperContext,
        WhisperContextParameters,
    };

    /// Local Whisper: the ggml model is loaded once and shared by every call.
    pub struct WhisperEngine {
        context: WhisperContext,
        decoder_program: PathBuf,
    }

    impl WhisperEngine {
        pub fn new(model_path: &str, decoder_program: impl Into<PathBuf>) -> ScribeResult<Self> {
            let context =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                    .map_err(|e| ScribeError::engine(format!("Whisper load failed: {}", e)))?;
            Ok(Self {
                context,
                decoder_program: decoder_program.into(),
            })
        }
    }

    impl SpeechEngine for WhisperEngine {
        fn name(&self) -> &str {
            "whisper"
        }

        fn transcribe(
            &self,
            media: &Path,
            language: Option<&str>,
            on_segment: &mut dyn FnMut(Segment),
            cancel: &CancelToken,
        ) -> ScribeResult<Transcript> {
            let samples = decode_pcm_f32(&self.decoder_program, media)?;
            let state = self
                .context
                .create_state()
                .map_err(|e| ScribeError::engine(format!("Whisper state init failed: {}", e)))?;

            let (tx, rx) = std::sync::mpsc::channel::<Segment>();
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_language(Some(language.unwrap_or("auto")));
            params.set_segment_callback_safe(move |data: SegmentCallbackData| {
                let _ = tx.send(Segment::new(
                    data.start_timestamp as f64 / 100.0,
                    data.end_timestamp as f64 / 100.0,
                    data.text,
                ));
            });
            let abort = cancel.clone();
            params.set_abort_callback_safe(move || abort.is_cancelled());

            // Inference runs on a scoped thread so segments reach the sink while it works.
            let mut emitted = Vec::new();
            let outcome = std::thread::scope(|scope| {
                let worker = scope.spawn(move || {
                    let mut state = state;
                    state.full(params, &samples)
                });
                for seg in rx {
                    on_segment(seg.clone());
                    emitted.push(seg);
                }
                worker.join()
            });
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if cancel.is_cancelled() => {
                    tracing::debug!(target: "scribe::engine", "whisper aborted: {}", e);
                    return Err(ScribeError::Cancelled);
                }
                Ok(Err(e)) => {
                    return Err(ScribeError::engine(format!("Whisper inference failed: {}", e)))
                }
                Err(_) => return Err(ScribeError::engine("Whisper inference thread panicked")),
            }
            Ok(Transcript::from_segments(emitted))
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_engine::WhisperEngine;

/// Create the best available engine, once per process.
/// Priority: (1) `WhisperEngine` if `whisper_model_path` is set and the model loads
/// (requires the `whisper` feature), (2) `RemoteEngine` if `stt_api_key` is set,
/// (3) `PlaceholderEngine`.
pub fn create_engine(
    config: &EngineConfig,
    decoder_program: &str,
) -> ScribeResult<Arc<dyn SpeechEngine>> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.whisper_model_path.as_deref().map(str::trim) {
            if !path.is_empty() {
                match WhisperEngine::new(path, decoder_program) {
                    Ok(w) => {
                        tracing::info!(target: "scribe::engine", "Whisper model loaded from {}", path);
                        return Ok(Arc::new(w));
                    }
                    Err(e) => tracing::warn!(target: "scribe::engine", "Whisper unavailable: {}", e),
                }
            }
        }
    }
    #[cfg(not(feature = "whisper"))]
    {
        if config.whisper_model_path.is_some() {
            tracing::warn!(
                target: "scribe::engine",
                "whisper_model_path set but built without the `whisper` feature (decoder: {})",
                decoder_program
            );
        }
    }
    if let Some(key) = config.stt_api_key.as_deref().map(str::trim) {
        if !key.is_empty() {
            tracing::info!(target: "scribe::engine", "Using remote STT at {}", config.stt_api_url);
            return Ok(Arc::new(RemoteEngine::new(
                config.stt_api_url.clone(),
                key,
                config.stt_model.clone(),
            )));
        }
    }
    tracing::warn!(target: "scribe::engine", "No speech engine configured; using placeholder");
    Ok(Arc::new(PlaceholderEngine::new()))
}
