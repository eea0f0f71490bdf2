//! Gateway and pipeline configuration.
//!
//! Precedence: environment `SCRIBE__*` (separator `__`, e.g. `SCRIBE__EMAIL__SMTP_HOST`)
//! > file named by `SCRIBE_CONFIG` (default `config/scribe.toml`) > defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ScribeResult;

/// Storage path value that selects the in-memory result store.
pub const MEMORY_STORAGE: &str = ":memory:";

/// Engine selection. See [`crate::engine::create_engine`] for priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local whisper model (ggml .bin). Used only with the `whisper` feature.
    #[serde(default)]
    pub whisper_model_path: Option<String>,
    /// OpenAI-compatible base URL without trailing slash.
    #[serde(default = "default_stt_api_url")]
    pub stt_api_url: String,
    #[serde(default)]
    pub stt_api_key: Option<String>,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            whisper_model_path: None,
            stt_api_url: default_stt_api_url(),
            stt_api_key: None,
            stt_model: default_stt_model(),
        }
    }
}

/// Recordings / videos lookup API used by the resolution chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

/// SMTP delivery. No `smtp_host` => notifications are only logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            from: None,
            to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScribeConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    /// Root for `audio_files/` and the sled `transcripts/` tree. `:memory:` keeps results in RAM.
    pub storage_path: String,
    /// Language hint for uploads. `auto` or empty lets the engine detect.
    #[serde(default)]
    pub language: Option<String>,
    /// Language for the webhook path; unset = auto-detect.
    #[serde(default)]
    pub webhook_language: Option<String>,
    /// Bearer token for auth-gated routes. Unset disables the gate.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Shared secret expected in `x-webhook-secret`. Unset rejects every webhook.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// 0 = no limit. A job running longer is failed on the next drain.
    pub job_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub trim_program: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

fn default_stt_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self {
            app_name: "Scribe Gateway".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6545,
            storage_path: "./data".to_string(),
            language: Some("de".to_string()),
            webhook_language: None,
            api_token: None,
            webhook_secret: None,
            http_timeout_secs: 30,
            download_timeout_secs: 1800,
            job_timeout_secs: 0,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            trim_program: "ffmpeg".to_string(),
            engine: EngineConfig::default(),
            provider: ProviderConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl ScribeConfig {
    /// Load config from file and environment.
    pub fn load() -> ScribeResult<Self> {
        let config_path =
            std::env::var("SCRIBE_CONFIG").unwrap_or_else(|_| "config/scribe.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> ScribeResult<Self> {
        let builder = config::Config::builder()
            .set_default("app_name", "Scribe Gateway")?
            .set_default("host", "127.0.0.1")?
            .set_default("port", 6545_i64)?
            .set_default("storage_path", "./data")?
            .set_default("language", "de")?
            .set_default("http_timeout_secs", 30_i64)?
            .set_default("download_timeout_secs", 1800_i64)?
            .set_default("job_timeout_secs", 0_i64)?
            .set_default("retry_attempts", 3_i64)?
            .set_default("retry_backoff_ms", 500_i64)?
            .set_default("trim_program", "ffmpeg")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SCRIBE").separator("__"))
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Upload language, `None` when auto-detect was asked for.
    pub fn upload_language(&self) -> Option<String> {
        normalize_language(self.language.as_deref())
    }

    pub fn webhook_language(&self) -> Option<String> {
        normalize_language(self.webhook_language.as_deref())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.storage_path.trim() == MEMORY_STORAGE
    }

    pub fn audio_dir(&self) -> PathBuf {
        if self.uses_memory_store() {
            std::env::temp_dir().join("scribe_audio_files")
        } else {
            Path::new(&self.storage_path).join("audio_files")
        }
    }

    pub fn transcripts_db_path(&self) -> PathBuf {
        Path::new(&self.storage_path).join("transcripts")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Bounded retry with exponential backoff (`backoff`, `2*backoff`, ...).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

fn normalize_language(lang: Option<&str>) -> Option<String> {
    lang.map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty() && s != "auto")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_language_means_detect() {
        let mut cfg = ScribeConfig::default();
        assert_eq!(cfg.upload_language().as_deref(), Some("de"));
        cfg.language = Some(" AUTO ".to_string());
        assert_eq!(cfg.upload_language(), None);
        assert_eq!(cfg.webhook_language(), None);
    }

    #[test]
    fn job_timeout_zero_is_off() {
        let mut cfg = ScribeConfig::default();
        assert!(cfg.job_timeout().is_none());
        cfg.job_timeout_secs = 90;
        assert_eq!(cfg.job_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scribe.toml");
        std::fs::write(
            &path,
            "port = 7000\nstorage_path = \":memory:\"\n[email]\nsmtp_host = \"mail.local\"\n",
        )
        .unwrap();
        let cfg = ScribeConfig::load_from(&path).unwrap();
        assert_eq!(cfg.port, 7000);
        assert!(cfg.uses_memory_store());
        assert_eq!(cfg.email.smtp_host.as_deref(), Some("mail.local"));
        assert_eq!(cfg.email.smtp_port, 587);
        assert_eq!(cfg.trim_program, "ffmpeg");
        assert_eq!(cfg.engine.stt_model, "whisper-1");
    }
}
