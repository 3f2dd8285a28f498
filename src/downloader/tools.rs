// Discovery and maintenance of the external executables

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use super::errors::DownloadError;
use super::utils::run_output_with_timeout;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolKind {
    /// Media extraction tool
    YtDlp,
    /// Muxer used for merging and audio extraction
    Ffmpeg,
}

impl ToolKind {
    pub fn binary_name(&self) -> &'static str {
        match self {
            ToolKind::YtDlp => "yt-dlp",
            ToolKind::Ffmpeg => "ffmpeg",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolKind::YtDlp => "--version",
            ToolKind::Ffmpeg => "-version",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub kind: ToolKind,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub is_available: bool,
}

/// Locates tools, honouring explicit overrides before searching the system
#[derive(Debug, Clone, Default)]
pub struct ToolManager {
    ytdlp_override: Option<PathBuf>,
    ffmpeg_override: Option<PathBuf>,
}

impl ToolManager {
    pub fn new(ytdlp_override: Option<PathBuf>, ffmpeg_override: Option<PathBuf>) -> Self {
        Self {
            ytdlp_override,
            ffmpeg_override,
        }
    }

    pub fn tool_info(&self, kind: ToolKind) -> ToolInfo {
        let path = self.locate(kind);
        let version = path.as_deref().and_then(|p| Self::version(p, kind));
        ToolInfo {
            kind,
            is_available: path.is_some(),
            version,
            path,
        }
    }

    pub fn all_tools(&self) -> Vec<ToolInfo> {
        vec![self.tool_info(ToolKind::YtDlp), self.tool_info(ToolKind::Ffmpeg)]
    }

    /// Path to run a tool with; falls back to the bare name so PATH lookup happens at spawn
    pub fn program(&self, kind: ToolKind) -> PathBuf {
        self.locate(kind)
            .unwrap_or_else(|| PathBuf::from(kind.binary_name()))
    }

    pub fn locate(&self, kind: ToolKind) -> Option<PathBuf> {
        let override_path = match kind {
            ToolKind::YtDlp => self.ytdlp_override.as_ref(),
            ToolKind::Ffmpeg => self.ffmpeg_override.as_ref(),
        };
        if let Some(path) = override_path {
            if path.exists() {
                return Some(path.clone());
            }
            tracing::warn!("[Tools] Configured {} not found at {}", kind.binary_name(), path.display());
        }

        let binary_name = kind.binary_name();

        // 1. Common install locations
        let common_paths = [
            format!("/opt/homebrew/bin/{}", binary_name),
            format!("/usr/local/bin/{}", binary_name),
            format!("/usr/bin/{}", binary_name),
        ];
        for path in common_paths {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. PATH
        let finder = if cfg!(windows) { "where" } else { "which" };
        if let Ok(output) = Command::new(finder).arg(binary_name).output() {
            if output.status.success() {
                let found = String::from_utf8_lossy(&output.stdout);
                if let Some(first) = found.lines().map(str::trim).find(|l| !l.is_empty()) {
                    return Some(PathBuf::from(first));
                }
            }
        }

        None
    }

    fn version(path: &Path, kind: ToolKind) -> Option<String> {
        match Command::new(path).arg(kind.version_arg()).output() {
            Ok(output) if output.status.success() => {
                let out = String::from_utf8_lossy(&output.stdout);
                // ffmpeg prints a banner; the first line carries the version
                out.lines().next().map(|l| l.trim().to_string())
            }
            _ => None,
        }
    }

    /// Self-update yt-dlp with its built-in updater
    pub async fn update_ytdlp(&self) -> Result<String, DownloadError> {
        let program = self.program(ToolKind::YtDlp);
        let program = program.to_string_lossy().to_string();
        tracing::info!("[Tools] Updating {}", program);

        let output = run_output_with_timeout(&program, vec!["-U".to_string()], 300).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if output.status.success() {
            tracing::info!("[Tools] Update finished: {}", stdout);
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("[Tools] Update failed: {}", stderr);
            Err(DownloadError::from_tool_failure(output.status.code(), &stderr))
        }
    }
}
