//! Download-URL resolution: an ordered list of strategies, first hit wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::webhook::client::MediaLookup;
use crate::webhook::event::{str_field, WebhookEvent};

/// Legacy payload ids longer than this are not treated as recording ids.
pub const LEGACY_ID_MAX_LEN: usize = 16;

const ENCODING_URL_KEYS: [&str; 3] = ["video_file_url", "url", "download_url"];
const CONTAINER_KEYS: [&str; 3] = ["video_container", "container", "format"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionMethod {
    Direct,
    LegacyEncodings,
    NewEncodings,
    RecordingsApi,
    VideosApi,
    LegacyRecordingsApi,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::Direct => "direct",
            ResolutionMethod::LegacyEncodings => "legacy_encodings",
            ResolutionMethod::NewEncodings => "new_encodings",
            ResolutionMethod::RecordingsApi => "recordings_api",
            ResolutionMethod::VideosApi => "videos_api",
            ResolutionMethod::LegacyRecordingsApi => "legacy_recordings_api",
        }
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    pub url: String,
    pub method: ResolutionMethod,
}

fn encoding_url(encoding: &Map<String, Value>) -> Option<&str> {
    ENCODING_URL_KEYS
        .iter()
        .find_map(|key| str_field(encoding, key))
}

fn is_mp4(encoding: &Map<String, Value>, url: &str) -> bool {
    let declared = CONTAINER_KEYS
        .iter()
        .filter_map(|key| str_field(encoding, key))
        .any(|c| c.eq_ignore_ascii_case("mp4"));
    if declared {
        return true;
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".mp4")
}

/// Height as a number or numeric string; anything else counts as 0.
fn encoding_height(encoding: &Map<String, Value>) -> u64 {
    match encoding.get("height") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|h| *h > 0.0).map(|h| h as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// URL of the tallest MP4 encoding. On equal heights the later entry wins.
pub fn select_best_mp4(encodings: &[Value]) -> Option<String> {
    let mut best: Option<(u64, &str)> = None;
    for encoding in encodings.iter().filter_map(Value::as_object) {
        let Some(url) = encoding_url(encoding) else {
            continue;
        };
        if !is_mp4(encoding, url) {
            continue;
        }
        let height = encoding_height(encoding);
        if best.map_or(true, |(h, _)| height >= h) {
            best = Some((height, url));
        }
    }
    best.map(|(_, url)| url.to_string())
}

/// One way of turning an event into a download URL.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    fn method(&self) -> ResolutionMethod;
    async fn resolve(&self, event: &WebhookEvent) -> Option<String>;
}

struct DirectUrl;

#[async_trait]
impl SourceResolver for DirectUrl {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Direct
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        str_field(&event.object_data, "download_url").map(str::to_string)
    }
}

struct LegacyEncodings;

#[async_trait]
impl SourceResolver for LegacyEncodings {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::LegacyEncodings
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        let encodings = event.legacy_payload.get("encodings")?.as_array()?;
        select_best_mp4(encodings)
    }
}

struct NewEncodings;

#[async_trait]
impl SourceResolver for NewEncodings {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::NewEncodings
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        let encodings = event.object_data.get("encodings")?.as_array()?;
        select_best_mp4(encodings)
    }
}

fn log_lookup_error(method: ResolutionMethod, id: &str, err: &crate::error::ScribeError) {
    tracing::warn!(target: "scribe::webhook", "{} lookup for {} failed: {}", method, id, err);
}

struct RecordingsApi {
    lookup: Arc<dyn MediaLookup>,
}

#[async_trait]
impl SourceResolver for RecordingsApi {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::RecordingsApi
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        if !event.is_recording() {
            return None;
        }
        let id = event.object_id()?;
        self.lookup
            .recording_download_url(id)
            .await
            .map_err(|e| log_lookup_error(self.method(), id, &e))
            .ok()
            .flatten()
    }
}

/// Any object with an id that is not typed as a recording, including untyped ones.
struct VideosApi {
    lookup: Arc<dyn MediaLookup>,
}

#[async_trait]
impl SourceResolver for VideosApi {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::VideosApi
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        if event.is_recording() {
            return None;
        }
        let id = event.object_id()?;
        self.lookup
            .video_download_url(id)
            .await
            .map_err(|e| log_lookup_error(self.method(), id, &e))
            .ok()
            .flatten()
    }
}

struct LegacyRecordingsApi {
    lookup: Arc<dyn MediaLookup>,
}

#[async_trait]
impl SourceResolver for LegacyRecordingsApi {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::LegacyRecordingsApi
    }

    async fn resolve(&self, event: &WebhookEvent) -> Option<String> {
        let id = str_field(&event.legacy_payload, "id")?;
        if id.chars().count() > LEGACY_ID_MAX_LEN {
            tracing::info!(target: "scribe::webhook", "legacy id {} too long for a recording id", id);
            return None;
        }
        self.lookup
            .recording_download_url(id)
            .await
            .map_err(|e| log_lookup_error(self.method(), id, &e))
            .ok()
            .flatten()
    }
}

/// Strategies in priority order.
pub struct ResolutionChain {
    strategies: Vec<Box<dyn SourceResolver>>,
}

impl ResolutionChain {
    pub fn new(strategies: Vec<Box<dyn SourceResolver>>) -> Self {
        Self { strategies }
    }

    /// direct, legacy encodings, new encodings, recordings API, videos API, legacy recordings API.
    pub fn standard(lookup: Arc<dyn MediaLookup>) -> Self {
        Self::new(vec![
            Box::new(DirectUrl),
            Box::new(LegacyEncodings),
            Box::new(NewEncodings),
            Box::new(RecordingsApi {
                lookup: lookup.clone(),
            }),
            Box::new(VideosApi {
                lookup: lookup.clone(),
            }),
            Box::new(LegacyRecordingsApi { lookup }),
        ])
    }

    pub fn methods(&self) -> Vec<ResolutionMethod> {
        self.strategies.iter().map(|s| s.method()).collect()
    }

    /// First strategy with a URL wins. Exhaustion is `None`, never an error.
    pub async fn resolve(&self, event: &WebhookEvent) -> Option<DownloadSource> {
        for strategy in &self.strategies {
            let method = strategy.method();
            match strategy.resolve(event).await {
                Some(url) => {
                    tracing::info!(target: "scribe::webhook", "resolved download URL via {}: {}", method, url);
                    return Some(DownloadSource { url, method });
                }
                None => tracing::info!(target: "scribe::webhook", "{}: no download URL", method),
            }
        }
        tracing::warn!(
            target: "scribe::webhook",
            "no download URL for {} event (object {})",
            event.event_type,
            event.object_id().unwrap_or("unknown")
        );
        None
    }
}
