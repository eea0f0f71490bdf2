//! Background transcription worker.
//!
//! Runs the engine on a blocking thread, forwards each segment to the job's progress
//! channel, and always finishes with one terminal message. Engine errors and panics are
//! turned into `Terminal::Error`; nothing escapes the worker.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::engine::SpeechEngine;
use crate::error::ScribeError;
use crate::registry::{JobRegistry, JobTicket};

/// Run one job to completion on the current thread.
pub fn run_transcription(
    engine: &dyn SpeechEngine,
    ticket: &JobTicket,
    media: &Path,
    language: Option<&str>,
) {
    let sender = &ticket.sender;
    let cancel = &ticket.cancel;
    tracing::info!(
        target: "scribe::worker",
        "job {}: {} transcribing {}",
        ticket.job_id,
        engine.name(),
        media.display()
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        engine.transcribe(
            media,
            language,
            &mut |seg| {
                if !cancel.is_cancelled() {
                    sender.segment(seg);
                }
            },
            cancel,
        )
    }));

    match outcome {
        Ok(Ok(transcript)) => {
            tracing::info!(
                target: "scribe::worker",
                "job {}: engine finished with {} segments",
                ticket.job_id,
                transcript.segments.len()
            );
            sender.end();
        }
        Ok(Err(ScribeError::Cancelled)) => {
            tracing::info!(target: "scribe::worker", "job {}: engine stopped on request", ticket.job_id);
            sender.end();
        }
        Ok(Err(ScribeError::Engine {
            message,
            diagnostic,
        })) => {
            tracing::error!(target: "scribe::worker", "job {}: {}\n{}", ticket.job_id, message, diagnostic);
            sender.error(message, diagnostic);
        }
        Ok(Err(other)) => {
            tracing::error!(target: "scribe::worker", "job {}: {}", ticket.job_id, other.chain());
            sender.error(other.to_string(), other.chain());
        }
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            tracing::error!(target: "scribe::worker", "job {}: engine panicked: {}", ticket.job_id, detail);
            sender.error("Speech engine panicked", detail);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn the worker on the blocking pool. The caller never waits on it.
pub fn spawn_transcription(
    engine: Arc<dyn SpeechEngine>,
    ticket: JobTicket,
    media: PathBuf,
    language: Option<String>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        run_transcription(engine.as_ref(), &ticket, &media, language.as_deref())
    })
}

/// Spawn the worker plus a watcher that reconciles the job once the worker exits, so a
/// job nobody polls still reaches its terminal state and frees the slot.
pub fn launch_job(
    registry: Arc<JobRegistry>,
    engine: Arc<dyn SpeechEngine>,
    ticket: JobTicket,
    media: PathBuf,
    language: Option<String>,
) -> JoinHandle<()> {
    let job_id = ticket.job_id.clone();
    let worker = spawn_transcription(engine, ticket, media, language);
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            tracing::error!(target: "scribe::worker", "job {}: worker task failed: {}", job_id, e);
        }
        match registry.reconcile(&job_id) {
            Ok(Some(status)) => {
                tracing::debug!(target: "scribe::worker", "job {} reconciled as {:?}", job_id, status)
            }
            Ok(None) => {}
            Err(e) => tracing::error!(target: "scribe::worker", "job {}: reconcile failed: {}", job_id, e),
        }
    })
}
