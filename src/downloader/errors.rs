// Error types for the download orchestration core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::StreamClass;

/// Reasons a pre-flight path check can reject a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationFailure {
    /// Destination folder is missing and could not be created
    CannotCreateFolder(String),
    /// Marker file could not be written or removed
    NoWritePermission,
    /// Target file is already present, never overwritten silently
    FileAlreadyExists,
    /// Free space below the configured threshold
    NotEnoughDiskSpace { available: u64, required: u64 },
}

impl ValidationFailure {
    /// Short reason string handed back to the caller
    pub fn reason(&self) -> String {
        match self {
            Self::CannotCreateFolder(detail) => format!("could not create folder: {}", detail),
            Self::NoWritePermission => "no write permission".to_string(),
            Self::FileAlreadyExists => "file already exists".to_string(),
            Self::NotEnoughDiskSpace { .. } => "not enough disk space".to_string(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DownloadError {
    /// Timeouts and connectivity problems, worth retrying
    #[error("Network error: {0}")]
    Network(String),

    /// The extractor does not recognise the URL
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// The probe returned no formats at all
    #[error("No formats available for this URL")]
    NoFormats,

    /// Formats exist but none of the requested stream class
    #[error("No compatible {0} formats found")]
    NoCompatibleFormats(StreamClass),

    /// The selected format is not in the current catalog
    #[error("Selected format is not available: {0}")]
    FormatNotAvailable(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationFailure),

    /// yt-dlp (or ffmpeg through it) exited with an error
    #[error("External tool failed (code {code:?}): {message}")]
    ExternalTool { code: Option<i32>, message: String },

    /// The tool reported success but no output file could be located
    #[error("Download failed: file not found after download ({0})")]
    FileNotFoundAfterDownload(String),

    #[error("Calibration is in progress")]
    CalibrationInProgress,

    #[error("A download is already in progress")]
    DownloadInProgress,

    /// Every calibration trial failed
    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl DownloadError {
    /// Only connectivity failures are surfaced as retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classify the diagnostic text of a failed tool run
    pub fn from_tool_failure(code: Option<i32>, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        if lower.contains("unsupported url") || lower.contains("is not a valid url") {
            return Self::UnsupportedUrl(summarize_stderr(stderr));
        }

        if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("network is unreachable")
            || lower.contains("name or service not known")
            || lower.contains("getaddrinfo failed")
            || lower.contains("temporary failure in name resolution")
            || lower.contains("unable to download webpage")
        {
            return Self::Network(summarize_stderr(stderr));
        }

        Self::ExternalTool {
            code,
            message: summarize_stderr(stderr),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Keep the lines a user can act on; fall back to the last non-empty line
fn summarize_stderr(stderr: &str) -> String {
    let important: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim())
        .filter(|l| l.starts_with("ERROR:") || l.contains("HTTP Error"))
        .take(3)
        .collect();

    if !important.is_empty() {
        return important.join(" | ");
    }

    stderr
        .lines()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Unknown error")
        .to_string()
}
