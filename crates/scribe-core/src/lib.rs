//! # Scribe Core - Transcription Job Orchestration
//!
//! Single-flight transcription jobs with incremental progress, plus a webhook pipeline that
//! turns "recording ready" events from a streaming provider into e-mailed transcripts.
//!
//! ## Architecture
//!
//! ```text
//!  upload ──► JobRegistry::try_start ──► worker (spawn_blocking)
//!                    ▲                        │ Segment… then End | Error
//!                    │ drain / reconcile      ▼
//!               ResultStore ◄──────── progress channel (unbounded FIFO)
//!
//!  webhook ──► readiness gate ──► ResolutionChain ──► download (temp file)
//!                                                       ──► transcribe ──► Notifier
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod notify;
pub mod registry;
pub mod store;
pub mod webhook;
pub mod worker;

pub use channel::{progress_channel, Control, Message, ProgressReceiver, ProgressSender, Terminal};
pub use config::{EmailConfig, EngineConfig, ProviderConfig, RetryPolicy, ScribeConfig};
pub use engine::{
    create_engine, transcribe_file, CancelToken, PlaceholderEngine, RemoteEngine, Segment,
    SpeechEngine, Transcript,
};
#[cfg(feature = "whisper")]
pub use engine::WhisperEngine;
pub use error::{ScribeError, ScribeResult};
pub use media::{extension_from_url, validate_job_id, FfmpegTrimmer, MediaLibrary, Trimmer};
pub use notify::{compose_notification, create_notifier, LogNotifier, Notification, Notifier, SmtpNotifier};
pub use registry::{JobError, JobRegistry, JobStatus, JobTicket, JobView, RegistryStatus};
pub use store::{MemoryResultStore, ResultStore, SledResultStore, TranscriptRecord};
pub use webhook::{IngestionPipeline, PipelineOutcome, ResolutionMethod, WebhookEvent};
pub use worker::{launch_job, run_transcription, spawn_transcription};

/// Crate version, reported by the gateway's health endpoint.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
