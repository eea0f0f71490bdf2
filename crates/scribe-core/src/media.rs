//! Media files: upload storage, in-place trimming, PCM decoding, URL extensions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::error::{ScribeError, ScribeResult};

/// Extensions kept when a downloaded file is written to disk.
pub const KNOWN_EXTENSIONS: [&str; 4] = ["mp4", "mov", "m4a", "mkv"];
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Extension of the URL's last path segment when it is a known media type, else `mp4`.
pub fn extension_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let last = path.rsplit('/').next().unwrap_or("");
    let ext = match last.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_EXTENSION,
    };
    KNOWN_EXTENSIONS
        .iter()
        .find(|known| **known == ext)
        .copied()
        .unwrap_or(DEFAULT_EXTENSION)
}

/// Rewrites a media file in place so it only covers `start..end`.
#[async_trait]
pub trait Trimmer: Send + Sync {
    async fn trim(&self, path: &Path, start: Option<&str>, end: Option<&str>) -> ScribeResult<()>;
}

/// Trims with an external ffmpeg-compatible program (`-ss` / `-to`, stream copy).
#[derive(Debug, Clone)]
pub struct FfmpegTrimmer {
    pub program: String,
}

impl FfmpegTrimmer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

#[async_trait]
impl Trimmer for FfmpegTrimmer {
    async fn trim(&self, path: &Path, start: Option<&str>, end: Option<&str>) -> ScribeResult<()> {
        let (start, end) = (non_empty(start), non_empty(end));
        if start.is_none() && end.is_none() {
            return Ok(());
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wav".to_string());
        let tmp = path.with_extension(format!("trim.{}", ext));

        let mut cmd = Command::new(&self.program);
        cmd.arg("-y").arg("-nostdin").arg("-i").arg(path);
        if let Some(s) = start {
            cmd.arg("-ss").arg(s);
        }
        if let Some(e) = end {
            cmd.arg("-to").arg(e);
        }
        // Uploads are stored without an extension; force a container for the output.
        if path.extension().is_none() {
            cmd.arg("-f").arg("wav");
        } else {
            cmd.arg("-c").arg("copy");
        }
        cmd.arg(&tmp);

        let output = cmd
            .output()
            .await
            .map_err(|e| ScribeError::Trim(format!("{}: {}", self.program, e)))?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ScribeError::Trim(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(target: "scribe::media", "trimmed {} to {:?}..{:?}", path.display(), start, end);
        Ok(())
    }
}

/// Decode any media file to 16 kHz mono f32 PCM using the external program. Blocking.
pub fn decode_pcm_f32(program: &Path, media: &Path) -> ScribeResult<Vec<f32>> {
    let output = std::process::Command::new(program)
        .args(["-nostdin", "-v", "error", "-i"])
        .arg(media)
        .args(["-f", "f32le", "-ac", "1", "-ar", "16000", "-"])
        .output()
        .map_err(|e| ScribeError::engine(format!("decoder {}: {}", program.display(), e)))?;
    if !output.status.success() {
        return Err(ScribeError::Engine {
            message: format!("decoder exited with {}", output.status),
            diagnostic: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output
        .stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Longest accepted job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Accept ids made of ASCII letters, digits, `-` and `_` only. Anything else is
/// rejected rather than rewritten, so distinct ids never share a file.
pub fn validate_job_id(id: &str) -> ScribeResult<&str> {
    let valid = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(ScribeError::InvalidInput(format!(
            "job id must be 1-{} characters of [A-Za-z0-9_-]",
            MAX_JOB_ID_LEN
        )))
    }
}

/// Stored uploads at `<root>/<job id>`.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: PathBuf,
}

impl MediaLibrary {
    pub fn open(root: impl Into<PathBuf>) -> ScribeResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, id: &str) -> ScribeResult<PathBuf> {
        Ok(self.root.join(validate_job_id(id)?))
    }

    pub async fn write(&self, id: &str, bytes: &[u8]) -> ScribeResult<PathBuf> {
        let path = self.path_for(id)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Write an upload under a private name inside the library. Dropping the
    /// returned file deletes it; [`MediaLibrary::commit`] moves it into place.
    pub async fn stage(&self, bytes: &[u8]) -> ScribeResult<NamedTempFile> {
        let staged = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&self.root)?;
        tokio::fs::write(staged.path(), bytes).await?;
        Ok(staged)
    }

    /// Move a staged upload to the path of `id`, replacing any previous file.
    pub fn commit(&self, id: &str, staged: NamedTempFile) -> ScribeResult<PathBuf> {
        let path = self.path_for(id)?;
        staged.persist(&path).map_err(|e| ScribeError::Io(e.error))?;
        tracing::debug!(target: "scribe::media", "stored upload for {} at {}", id, path.display());
        Ok(path)
    }

    /// Path of the stored file, `None` when absent.
    pub fn find(&self, id: &str) -> ScribeResult<Option<PathBuf>> {
        let path = self.path_for(id)?;
        Ok(path.is_file().then_some(path))
    }

    /// Remove the file. A missing file is not an error.
    pub async fn remove(&self, id: &str) -> ScribeResult<bool> {
        match tokio::fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_taken_from_last_segment() {
        assert_eq!(extension_from_url("https://cdn.example/v/clip_720p.MOV"), "mov");
        assert_eq!(extension_from_url("https://cdn.example/a.m4a?sig=abc.mkv"), "m4a");
        assert_eq!(extension_from_url("https://cdn.example/file.mkv#t=10"), "mkv");
    }

    #[test]
    fn unknown_extension_defaults_to_mp4() {
        assert_eq!(extension_from_url("https://cdn.example/stream.m3u8"), "mp4");
        assert_eq!(extension_from_url("https://cdn.example/download"), "mp4");
        assert_eq!(extension_from_url("https://cdn.v1.example/"), "mp4");
    }

    #[tokio::test]
    async fn library_write_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let lib = MediaLibrary::open(dir.path().join("audio_files")).unwrap();
        let path = lib.write("job-1", b"RIFF").await.unwrap();
        assert_eq!(lib.find("job-1").unwrap(), Some(path));
        assert!(lib.remove("job-1").await.unwrap());
        assert!(lib.find("job-1").unwrap().is_none());
        assert!(!lib.remove("job-1").await.unwrap());
    }

    #[test]
    fn unsafe_ids_are_rejected_not_rewritten() {
        let lib = MediaLibrary {
            root: PathBuf::from("/srv/audio"),
        };
        for id in ["../etc/passwd", "..", "", "job.1", "a/b", "ü", "x".repeat(MAX_JOB_ID_LEN + 1).as_str()] {
            assert!(
                matches!(lib.path_for(id), Err(ScribeError::InvalidInput(_))),
                "{id:?} accepted"
            );
        }
        assert_eq!(lib.path_for("job_1-A").unwrap(), PathBuf::from("/srv/audio/job_1-A"));
    }

    #[tokio::test]
    async fn near_identical_ids_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let lib = MediaLibrary::open(dir.path()).unwrap();
        assert!(lib.write("job.1", b"first").await.is_err());
        lib.write("job-1", b"first").await.unwrap();
        lib.write("job1", b"second").await.unwrap();
        assert!(lib.remove("job1").await.unwrap());
        let kept = lib.find("job-1").unwrap().unwrap();
        assert_eq!(std::fs::read(kept).unwrap(), b"first");
    }

    #[tokio::test]
    async fn staged_upload_is_invisible_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        let lib = MediaLibrary::open(dir.path()).unwrap();
        lib.write("job", b"running").await.unwrap();

        let staged = lib.stage(b"replacement").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("job")).unwrap(), b"running");
        let path = lib.commit("job", staged).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"replacement");

        // Dropped without commit: nothing left behind.
        drop(lib.stage(b"abandoned").await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn trim_without_bounds_is_a_no_op() {
        let trimmer = FfmpegTrimmer::new("definitely-not-installed-binary");
        trimmer.trim(Path::new("/nonexistent"), Some(" "), None).await.unwrap();
    }

    #[tokio::test]
    async fn trim_reports_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip");
        std::fs::write(&file, b"data").unwrap();
        let trimmer = FfmpegTrimmer::new("definitely-not-installed-binary");
        let err = trimmer.trim(&file, Some("0"), Some("5")).await.unwrap_err();
        assert!(matches!(err, ScribeError::Trim(_)));
        assert!(file.exists());
    }
}
