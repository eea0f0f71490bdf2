//! Streaming-provider webhooks: readiness gate, download-URL resolution, ingestion pipeline.

pub mod client;
pub mod event;
pub mod pipeline;
pub mod resolve;

pub use client::{
    extract_download_url, HttpFetcher, MediaFetcher, MediaLookup, NoLookup, ProviderApiClient,
};
pub use event::{WebhookEvent, READY_EVENTS, UPDATE_EVENTS};
pub use pipeline::{with_retry, IngestionPipeline, PipelineOutcome, PipelineStage};
pub use resolve::{
    select_best_mp4, DownloadSource, ResolutionChain, ResolutionMethod, SourceResolver,
    LEGACY_ID_MAX_LEN,
};
