//! Single-track URL extraction.
//!
//! An [`Extractor`] turns one catalog track id into a fetchable, signed
//! upstream URL. Extraction is slow and rate-limit sensitive, which is why
//! the [`Resolver`](crate::resolver::Resolver) caches its results.
//!
//! The production implementation, [`YtDlp`], shells out to the `yt-dlp`
//! tool and classifies its diagnostics into a [`ResolveError`].

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Why a track could not be resolved.
///
/// Every variant carries the upstream diagnostic for logging.
#[derive(Clone, Debug, Error, PartialEq, Eq, Hash)]
pub enum ResolveError {
    #[error("track unavailable: {0}")]
    Unavailable(String),

    #[error("track not available in this region: {0}")]
    RegionLocked(String),

    #[error("track is private or deleted: {0}")]
    PrivateOrDeleted(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("network error: {0}")]
    Network(String),
}

impl ResolveError {
    /// Whether trying again later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Unavailable(_)
            | Self::RegionLocked(_)
            | Self::PrivateOrDeleted(_)
            | Self::Extraction(_) => false,
        }
    }

    /// Classifies a diagnostic message from the extraction tool.
    ///
    /// Order matters: "private video" messages also say "unavailable", and
    /// regional blocks mention availability too.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let message = message.trim().to_owned();

        if lower.contains("private") {
            Self::PrivateOrDeleted(message)
        } else if lower.contains("in your country")
            || lower.contains("region")
            || lower.contains("blocked")
        {
            Self::RegionLocked(message)
        } else if lower.contains("removed") || lower.contains("deleted") {
            Self::PrivateOrDeleted(message)
        } else if lower.contains("video unavailable") || lower.contains("not available") {
            Self::Unavailable(message)
        } else if lower.contains("network")
            || lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains("name resolution")
        {
            Self::Network(message)
        } else {
            Self::Extraction(message)
        }
    }
}

/// Resolves a single track id into an upstream URL.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Returns the upstream URL for `track_id` as reported by the backend.
    async fn extract(&self, track_id: &str) -> Result<String, ResolveError>;
}

/// Extractor backed by the `yt-dlp` command-line tool.
#[derive(Clone, Debug)]
pub struct YtDlp {
    program: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    /// Prefers plain HTTPS audio so the proxy can relay and range-request
    /// it; falls back to anything audio, then anything at all.
    pub const FORMAT: &'static str =
        "bestaudio[protocol^=https][ext=webm]/bestaudio[protocol^=https]/bestaudio/best";

    /// Time allowed for one run of the tool before it is killed.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    const WATCH_URL: &'static str = "https://youtube.com/watch?v=";

    /// Runs `program` for every extraction, killing it after `timeout`.
    ///
    /// `program` may be a bare name looked up on `PATH`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, track_id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-g")
            .arg("-f")
            .arg(Self::FORMAT)
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(format!("{}{track_id}", Self::WATCH_URL))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp", Self::DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn extract(&self, track_id: &str) -> Result<String, ResolveError> {
        let child = self.command(track_id).output();

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                ResolveError::Network(format!(
                    "{} timed out after {}s",
                    self.program.display(),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                ResolveError::Extraction(format!(
                    "could not run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::classify(&stderr));
        }

        // With split audio and video formats the tool prints one URL per
        // line; the first one is the best audio stream.
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| ResolveError::Extraction("no stream url in output".to_owned()))
    }
}
