//! Error types for Scribe jobs and webhook ingestion

use thiserror::Error;

/// Result type alias for Scribe operations
pub type ScribeResult<T> = Result<T, ScribeError>;

/// Errors that can occur across the job registry, engines, and the webhook pipeline
#[derive(Error, Debug)]
pub enum ScribeError {
    /// Another job holds the single-flight slot.
    #[error("A transcription is already running: {running}")]
    Busy { running: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller-supplied value rejected before any work starts.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model or inference failure. `diagnostic` carries the error chain / panic payload.
    #[error("Engine error: {message}")]
    Engine { message: String, diagnostic: String },

    #[error("Transcription cancelled")]
    Cancelled,

    #[error("No download URL could be resolved")]
    ResolutionExhausted,

    #[error("Download error: {0}")]
    Download(String),

    #[error("Transcription error: {0}")]
    Transcribe(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Trim error: {0}")]
    Trim(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScribeError {
    pub fn engine(message: impl Into<String>) -> Self {
        let message = message.into();
        ScribeError::Engine {
            diagnostic: message.clone(),
            message,
        }
    }

    /// Message plus every `source()` below it, one per line.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(inner) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&inner.to_string());
            source = inner.source();
        }
        out
    }
}

impl From<sled::Error> for ScribeError {
    fn from(err: sled::Error) -> Self {
        ScribeError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ScribeError {
    fn from(err: serde_json::Error) -> Self {
        ScribeError::Store(err.to_string())
    }
}

impl From<config::ConfigError> for ScribeError {
    fn from(err: config::ConfigError) -> Self {
        ScribeError::Config(err.to_string())
    }
}

impl From<lettre::error::Error> for ScribeError {
    fn from(err: lettre::error::Error) -> Self {
        ScribeError::Notify(err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for ScribeError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        ScribeError::Notify(err.to_string())
    }
}
