//! Single-flight job registry.
//!
//! At most one job is `Running`. The registry owns the active job's accumulated text and
//! segments and its progress receiver; the worker only reaches this state through the
//! channel. All operations take one lock; draining never suspends, so holding it is fine.
//!
//! ```text
//! Idle --try_start--> Running --Terminal::End---> Succeeded (persisted) --> Idle
//!                             \--Terminal::Error-> Failed (not persisted) -> Idle
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::channel::{progress_channel, Control, Message, ProgressReceiver, ProgressSender, Terminal};
use crate::engine::{append_text, CancelToken, Segment};
use crate::error::{ScribeError, ScribeResult};
use crate::store::{ResultStore, TranscriptRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub diagnostic: String,
}

/// Snapshot returned by [`JobRegistry::drain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub text: String,
    pub segments: Vec<Segment>,
    pub error: Option<JobError>,
}

/// Handed to the worker by `try_start`.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: String,
    pub sender: ProgressSender,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStatus {
    pub running_job_id: Option<String>,
}

struct ActiveJob {
    id: String,
    file_name: String,
    text: String,
    segments: Vec<Segment>,
    receiver: ProgressReceiver,
    /// Registry's own producer handle, used to inject stop/terminal messages.
    sender: ProgressSender,
    cancel: CancelToken,
    started: Instant,
    stop_requested: bool,
}

impl ActiveJob {
    fn view(&self, status: JobStatus, error: Option<JobError>) -> JobView {
        JobView {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            status,
            text: self.text.clone(),
            segments: self.segments.clone(),
            error,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    active: Option<ActiveJob>,
    /// Failure observed by the completion watcher, held for the next poll of that id.
    unreported_failure: Option<JobView>,
}

/// Who is draining: a poller consumes a failure, the watcher retains it for the poller.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Drainer {
    Poll,
    Watcher,
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn ResultStore>,
    job_timeout: Option<Duration>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            store,
            job_timeout: None,
        }
    }

    /// Fail a job still `Running` after `timeout`. Checked on drain and whenever the
    /// slot is inspected, so a hung job that nobody polls still frees the slot.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `job_id`. Rejects with `Busy` while any job is running.
    pub fn try_start(&self, job_id: &str, file_name: &str) -> ScribeResult<JobTicket> {
        let mut state = self.lock();
        self.expire_stale(&mut state);
        if let Some(active) = state.active.as_ref() {
            tracing::info!(
                target: "scribe::jobs",
                "rejecting job {}: {} is running",
                job_id,
                active.id
            );
            return Err(ScribeError::Busy {
                running: active.id.clone(),
            });
        }
        if state
            .unreported_failure
            .as_ref()
            .is_some_and(|f| f.id == job_id)
        {
            state.unreported_failure = None;
        }

        let (sender, receiver) = progress_channel();
        let cancel = CancelToken::new();
        state.active = Some(ActiveJob {
            id: job_id.to_string(),
            file_name: file_name.to_string(),
            text: String::new(),
            segments: Vec::new(),
            receiver,
            sender: sender.clone(),
            cancel: cancel.clone(),
            started: Instant::now(),
            stop_requested: false,
        });
        tracing::info!(target: "scribe::jobs", "job {} started ({})", job_id, file_name);
        Ok(JobTicket {
            job_id: job_id.to_string(),
            sender,
            cancel,
        })
    }

    /// Apply every buffered message for `job_id` and return its view.
    ///
    /// `None` when `job_id` is neither the active job nor an unreported failure; callers
    /// then consult the result store. A `Succeeded` view means the record was persisted.
    pub fn drain(&self, job_id: &str) -> ScribeResult<Option<JobView>> {
        let mut state = self.lock();
        if let Some(view) = self.drain_locked(&mut state, job_id, Drainer::Poll)? {
            return Ok(Some(view));
        }
        match state.unreported_failure.take() {
            Some(failed) if failed.id == job_id => Ok(Some(failed)),
            other => {
                state.unreported_failure = other;
                Ok(None)
            }
        }
    }

    /// Drain on behalf of the completion watcher once the worker has exited.
    /// A failure found here stays available to the next `drain` of that id.
    pub fn reconcile(&self, job_id: &str) -> ScribeResult<Option<JobStatus>> {
        let mut state = self.lock();
        Ok(self
            .drain_locked(&mut state, job_id, Drainer::Watcher)?
            .map(|v| v.status))
    }

    fn drain_locked(
        &self,
        state: &mut RegistryState,
        job_id: &str,
        drainer: Drainer,
    ) -> ScribeResult<Option<JobView>> {
        let Some(active) = state.active.as_mut().filter(|a| a.id == job_id) else {
            return Ok(None);
        };

        let mut terminal = None;
        while let Some(msg) = active.receiver.try_dequeue() {
            match msg {
                Message::Segment(seg) => {
                    append_text(&mut active.text, &seg.text);
                    active.segments.push(seg);
                }
                Message::Control(Control::Stop) => {
                    active.stop_requested = true;
                    tracing::debug!(target: "scribe::jobs", "job {} observed stop", job_id);
                }
                Message::Terminal(t) => {
                    // Anything queued behind the terminal message is ignored.
                    terminal = Some(t);
                    break;
                }
            }
        }

        if terminal.is_none() {
            if let Some(limit) = self.job_timeout {
                if active.started.elapsed() > limit {
                    active.cancel.cancel();
                    terminal = Some(Terminal::Error {
                        message: format!("Transcription timed out after {}s", limit.as_secs()),
                        diagnostic: format!("job {} exceeded job_timeout_secs", job_id),
                    });
                }
            }
        }

        let Some(terminal) = terminal else {
            return Ok(Some(active.view(JobStatus::Running, None)));
        };

        // Terminal: the slot is freed whatever happens below.
        let Some(job) = state.active.take() else {
            return Ok(None);
        };
        match terminal {
            Terminal::End => match self.persist(&job) {
                Ok(()) => {
                    tracing::info!(
                        target: "scribe::jobs",
                        "job {} succeeded ({} segments{})",
                        job.id,
                        job.segments.len(),
                        if job.stop_requested { ", stopped" } else { "" }
                    );
                    Ok(Some(job.view(JobStatus::Succeeded, None)))
                }
                Err(e) => {
                    tracing::error!(target: "scribe::jobs", "job {} could not be persisted: {}", job.id, e.chain());
                    let error = JobError {
                        message: format!("Could not persist transcript: {}", e),
                        diagnostic: e.chain(),
                    };
                    Ok(Some(Self::record_failure(state, &job, error, drainer)))
                }
            },
            Terminal::Error {
                message,
                diagnostic,
            } => {
                tracing::warn!(target: "scribe::jobs", "job {} failed: {}", job.id, message);
                let error = JobError {
                    message,
                    diagnostic,
                };
                Ok(Some(Self::record_failure(state, &job, error, drainer)))
            }
        }
    }

    /// Settle the active job if it has outlived the timeout. The failure is kept for
    /// the next poll of that id.
    fn expire_stale(&self, state: &mut RegistryState) {
        let Some(limit) = self.job_timeout else {
            return;
        };
        let Some(id) = state
            .active
            .as_ref()
            .filter(|a| a.started.elapsed() > limit)
            .map(|a| a.id.clone())
        else {
            return;
        };
        if let Err(e) = self.drain_locked(state, &id, Drainer::Watcher) {
            tracing::error!(target: "scribe::jobs", "could not settle stale job {}: {}", id, e.chain());
        }
    }

    fn record_failure(
        state: &mut RegistryState,
        job: &ActiveJob,
        error: JobError,
        drainer: Drainer,
    ) -> JobView {
        let view = job.view(JobStatus::Failed, Some(error));
        if drainer == Drainer::Watcher {
            state.unreported_failure = Some(view.clone());
        }
        view
    }

    /// Insert, or update when a record with this id already exists.
    fn persist(&self, job: &ActiveJob) -> ScribeResult<()> {
        let record = TranscriptRecord::new(
            job.id.clone(),
            job.file_name.clone(),
            job.text.clone(),
            job.segments.clone(),
            Local::now(),
        );
        if self.store.contains(&job.id)? {
            self.store.update(&record)
        } else {
            self.store.insert(&record)
        }
    }

    /// Advisory stop: queue `Control::Stop` then `Terminal::End` and raise the cancel flag.
    /// The engine call may keep running until it next checks the flag.
    pub fn request_stop(&self, job_id: &str) -> ScribeResult<()> {
        let state = self.lock();
        let active = state
            .active
            .as_ref()
            .filter(|a| a.id == job_id)
            .ok_or_else(|| ScribeError::NotFound(format!("No running job {}", job_id)))?;
        active.cancel.cancel();
        active.sender.stop();
        active.sender.end();
        tracing::info!(target: "scribe::jobs", "stop requested for job {}", job_id);
        Ok(())
    }

    /// Stop whichever job is running and return its id.
    pub fn request_stop_active(&self) -> ScribeResult<String> {
        let running = self
            .status()
            .running_job_id
            .ok_or_else(|| ScribeError::NotFound("No transcription running".to_string()))?;
        self.request_stop(&running)?;
        Ok(running)
    }

    pub fn status(&self) -> RegistryStatus {
        let mut state = self.lock();
        self.expire_stale(&mut state);
        RegistryStatus {
            running_job_id: state.active.as_ref().map(|a| a.id.clone()),
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        self.expire_stale(&mut state);
        state.active.as_ref().is_some_and(|a| a.id == job_id)
    }
}
