//! Outbound HTTP for the webhook path: provider metadata lookups and media downloads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::config::ScribeConfig;
use crate::error::{ScribeError, ScribeResult};
use crate::webhook::event::str_field;
use crate::webhook::resolve::select_best_mp4;

/// Provider metadata lookups by object id. `Ok(None)` is a miss.
#[async_trait]
pub trait MediaLookup: Send + Sync {
    async fn recording_download_url(&self, id: &str) -> ScribeResult<Option<String>>;
    async fn video_download_url(&self, id: &str) -> ScribeResult<Option<String>>;
}

/// Used when no provider API base URL is configured; every lookup misses.
pub struct NoLookup;

#[async_trait]
impl MediaLookup for NoLookup {
    async fn recording_download_url(&self, _id: &str) -> ScribeResult<Option<String>> {
        Ok(None)
    }

    async fn video_download_url(&self, _id: &str) -> ScribeResult<Option<String>> {
        Ok(None)
    }
}

/// REST client for `GET {base}/recordings/{id}` and `GET {base}/videos/{id}`.
pub struct ProviderApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ProviderApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> ScribeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScribeError::Config(format!("provider client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// `None` when `provider.api_base_url` is unset.
    pub fn from_config(config: &ScribeConfig) -> ScribeResult<Option<Self>> {
        match config.provider.api_base_url.as_deref().map(str::trim) {
            Some(base) if !base.is_empty() => Ok(Some(Self::new(
                base,
                config.provider.api_token.clone(),
                config.http_timeout(),
            )?)),
            _ => Ok(None),
        }
    }

    async fn get_json(&self, path: &str) -> ScribeResult<Option<Value>> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ScribeError::Download(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            tracing::info!(target: "scribe::webhook", "GET {} returned {}", url, resp.status());
            return Ok(None);
        }
        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| ScribeError::Download(format!("GET {url}: invalid JSON: {e}")))?;
        Ok(Some(body))
    }
}

/// `download_url` at the root or under `wrapper`, else the best MP4 encoding.
pub fn extract_download_url(body: &Value, wrapper: &str) -> Option<String> {
    let root = body.as_object()?;
    let nested = root.get(wrapper).and_then(Value::as_object);

    if let Some(url) = str_field(root, "download_url")
        .or_else(|| nested.and_then(|n| str_field(n, "download_url")))
    {
        return Some(url.to_string());
    }
    root.get("encodings")
        .or_else(|| nested.and_then(|n| n.get("encodings")))
        .and_then(Value::as_array)
        .and_then(|encodings| select_best_mp4(encodings))
}

#[async_trait]
impl MediaLookup for ProviderApiClient {
    async fn recording_download_url(&self, id: &str) -> ScribeResult<Option<String>> {
        Ok(self
            .get_json(&format!("recordings/{id}"))
            .await?
            .and_then(|body| extract_download_url(&body, "recording")))
    }

    async fn video_download_url(&self, id: &str) -> ScribeResult<Option<String>> {
        Ok(self
            .get_json(&format!("videos/{id}"))
            .await?
            .and_then(|body| extract_download_url(&body, "video")))
    }
}

/// Writes the bytes behind `url` to `dest`.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> ScribeResult<u64>;
}

/// Streaming HTTP download; the body is never buffered whole.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> ScribeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScribeError::Config(format!("download client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> ScribeResult<u64> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScribeError::Download(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ScribeError::Download(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(dest)
            .await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ScribeError::Download(format!("GET {url}: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        tracing::debug!(target: "scribe::webhook", "downloaded {} bytes to {}", written, dest.display());
        Ok(written)
    }
}
