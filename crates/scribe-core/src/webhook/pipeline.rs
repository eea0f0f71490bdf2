//! Webhook ingestion: resolve -> download -> transcribe -> notify, with the media held in a
//! temporary file that is deleted on every exit path.
//!
//! Nothing here raises to the caller. Each stage failure is logged and ends the run; the
//! returned [`PipelineOutcome`] exists for tests and logging.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::task::JoinHandle;

use crate::config::{RetryPolicy, ScribeConfig};
use crate::engine::{transcribe_file, SpeechEngine};
use crate::error::{ScribeError, ScribeResult};
use crate::media::extension_from_url;
use crate::notify::{compose_notification, create_notifier, Notifier};
use crate::webhook::client::{HttpFetcher, MediaFetcher, MediaLookup, NoLookup, ProviderApiClient};
use crate::webhook::event::WebhookEvent;
use crate::webhook::resolve::{DownloadSource, ResolutionChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Download,
    Transcribe,
    Notify,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStage::Download => "download",
            PipelineStage::Transcribe => "transcribe",
            PipelineStage::Notify => "notify",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    NotReady,
    Unresolved,
    Delivered {
        source: DownloadSource,
        name: String,
        characters: usize,
    },
    Failed {
        stage: PipelineStage,
        error: String,
    },
}

/// Run `op` up to `policy.attempts` times, sleeping `policy.delay_for(n)` between tries.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> ScribeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ScribeResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target: "scribe::webhook",
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    what,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct IngestionPipeline {
    resolver: ResolutionChain,
    fetcher: Arc<dyn MediaFetcher>,
    engine: Arc<dyn SpeechEngine>,
    notifier: Arc<dyn Notifier>,
    language: Option<String>,
    retry: RetryPolicy,
    temp_dir: Option<PathBuf>,
}

impl IngestionPipeline {
    pub fn new(
        resolver: ResolutionChain,
        fetcher: Arc<dyn MediaFetcher>,
        engine: Arc<dyn SpeechEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            engine,
            notifier,
            language: None,
            retry: RetryPolicy::once(),
            temp_dir: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Directory for downloaded media; the system temp dir when unset.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &ScribeConfig, engine: Arc<dyn SpeechEngine>) -> ScribeResult<Self> {
        let lookup: Arc<dyn MediaLookup> = match ProviderApiClient::from_config(config)? {
            Some(client) => Arc::new(client),
            None => {
                tracing::info!(target: "scribe::webhook", "provider API not configured; lookups disabled");
                Arc::new(NoLookup)
            }
        };
        Ok(Self::new(
            ResolutionChain::standard(lookup),
            Arc::new(HttpFetcher::new(config.download_timeout())?),
            engine,
            create_notifier(&config.email)?,
        )
        .with_language(config.webhook_language())
        .with_retry(config.retry_policy()))
    }

    fn temp_file(&self, extension: &str) -> ScribeResult<NamedTempFile> {
        let suffix = format!(".{extension}");
        let mut builder = tempfile::Builder::new();
        builder.prefix("scribe-webhook-").suffix(&suffix);
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    async fn download(&self, source: &DownloadSource) -> ScribeResult<NamedTempFile> {
        let extension = extension_from_url(&source.url);
        with_retry(self.retry, "download", || async move {
            let file = self.temp_file(extension)?;
            self.fetcher.fetch(&source.url, file.path()).await?;
            Ok::<_, ScribeError>(file)
        })
        .await
    }

    async fn transcribe(&self, media: &NamedTempFile) -> ScribeResult<String> {
        let engine = self.engine.clone();
        let path = media.path().to_path_buf();
        let language = self.language.clone();
        let transcript = tokio::task::spawn_blocking(move || {
            transcribe_file(engine.as_ref(), &path, language.as_deref())
        })
        .await
        .map_err(|e| ScribeError::Transcribe(format!("worker task failed: {e}")))??;
        Ok(transcript.text)
    }

    /// Process one event end to end. Never returns an error; see [`PipelineOutcome`].
    pub async fn run(&self, event: WebhookEvent) -> PipelineOutcome {
        if !event.is_ready() {
            tracing::debug!(target: "scribe::webhook", "ignoring '{}' event", event.event_type);
            return PipelineOutcome::NotReady;
        }

        let Some(source) = self.resolver.resolve(&event).await else {
            tracing::warn!(target: "scribe::webhook", "{}", ScribeError::ResolutionExhausted);
            return PipelineOutcome::Unresolved;
        };
        let name = event.display_name();

        // Dropping `media` deletes the file, on success and on every early return below.
        let media = match self.download(&source).await {
            Ok(file) => file,
            Err(e) => return failed(PipelineStage::Download, &name, e),
        };
        tracing::info!(target: "scribe::webhook", "downloaded '{}' to {}", name, media.path().display());

        let text = match self.transcribe(&media).await {
            Ok(text) => text,
            Err(e) => return failed(PipelineStage::Transcribe, &name, e),
        };

        let notification = compose_notification(&event.event_type, source.method, &name, &text);
        let notifier = self.notifier.as_ref();
        if let Err(e) = with_retry(self.retry, "notify", || notifier.send(&notification)).await {
            return failed(PipelineStage::Notify, &name, e);
        }

        tracing::info!(
            target: "scribe::webhook",
            "delivered transcript for '{}' via {} ({} chars)",
            name,
            notifier.name(),
            text.chars().count()
        );
        PipelineOutcome::Delivered {
            source,
            name,
            characters: text.chars().count(),
        }
    }

    /// Readiness gate plus a detached run. `None` when the event was skipped.
    pub fn handle_event(self: &Arc<Self>, event: WebhookEvent) -> Option<JoinHandle<PipelineOutcome>> {
        if !event.is_ready() {
            tracing::info!(target: "scribe::webhook", "event '{}' is not a ready event; skipped", event.event_type);
            return None;
        }
        let pipeline = Arc::clone(self);
        Some(tokio::spawn(async move { pipeline.run(event).await }))
    }
}

fn failed(stage: PipelineStage, name: &str, err: ScribeError) -> PipelineOutcome {
    tracing::error!(target: "scribe::webhook", "{} failed for '{}': {}", stage, name, err.chain());
    PipelineOutcome::Failed {
        stage,
        error: err.to_string(),
    }
}
