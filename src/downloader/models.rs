// Common data models for the download core

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the user wants out of a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadType {
    /// Selected video stream merged with the best audio stream
    VideoAndAudio,
    /// Selected video stream as-is
    VideoOnly,
    /// Selected audio stream, re-encoded to mp3
    AudioOnly,
}

impl DownloadType {
    /// Stream class the catalog is filtered to
    pub fn stream_class(&self) -> StreamClass {
        match self {
            Self::VideoAndAudio | Self::VideoOnly => StreamClass::Video,
            Self::AudioOnly => StreamClass::Audio,
        }
    }

    /// Ordered stream phases fetched for this type
    pub fn phases(&self) -> Vec<Phase> {
        match self {
            Self::VideoAndAudio => vec![Phase::Video, Phase::Audio],
            Self::VideoOnly => vec![Phase::Video],
            Self::AudioOnly => vec![Phase::Audio],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamClass {
    Video,
    Audio,
}

impl fmt::Display for StreamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// One stage of a download request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Video,
    Audio,
    Merging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Merging => write!(f, "merging"),
        }
    }
}

/// Raw format descriptor as printed by `yt-dlp --dump-json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    /// Format ID (e.g., "137", "140")
    pub format_id: String,
    /// File extension (mp4, webm, m4a)
    pub ext: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub width: Option<u32>,
    #[serde(deserialize_with = "lenient_u32")]
    pub height: Option<u32>,
    pub fps: Option<f64>,
    /// Video codec (avc1, vp9, av01, none)
    pub vcodec: Option<String>,
    /// Audio codec (mp4a, opus, none)
    pub acodec: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub filesize: Option<u64>,
    /// Approximate file size (when exact is unknown)
    #[serde(deserialize_with = "lenient_u64")]
    pub filesize_approx: Option<u64>,
    /// Average audio bitrate in kbps
    pub abr: Option<f64>,
    /// Total bitrate in kbps
    pub tbr: Option<f64>,
    pub format_note: Option<String>,
}

impl RawFormat {
    /// Exact file size when known, approximate otherwise
    pub fn effective_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    pub fn has_video(&self) -> bool {
        codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        codec_present(&self.acodec)
    }

    /// No video codec and a real audio codec
    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }
}

// yt-dlp prints some integral fields as floats depending on the extractor
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.round() as u64))
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(lenient_u64(deserializer)?.map(|v| v.min(u32::MAX as u64) as u32))
}

fn codec_present(codec: &Option<String>) -> bool {
    codec
        .as_deref()
        .map_or(false, |c| !c.is_empty() && c != "none")
}

/// Probe result for one URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub id: String,
    pub title: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Vec<RawFormat>,
}

/// Ordering key of a catalog entry: (height or bitrate, fps)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct SortKey {
    pub rank: f64,
    pub fps: f64,
}

/// One presentable download choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatEntry {
    /// Unique human-readable label, e.g. "720p (30fps) - 45.2 MB"
    pub display_label: String,
    /// Identifier understood by the extractor, or `direct:<url>`
    pub format_id: String,
    pub extension: String,
    pub sort_key: SortKey,
}

impl FormatEntry {
    /// Label text before the size suffix, used in output file names
    pub fn format_part(&self) -> &str {
        self.display_label
            .split(" - ")
            .next()
            .unwrap_or(&self.display_label)
            .trim()
    }

    pub fn direct_url(&self) -> Option<&str> {
        self.format_id.strip_prefix(DIRECT_PREFIX)
    }
}

/// Prefix of synthetic format ids for directly resolved media
pub const DIRECT_PREFIX: &str = "direct:";

/// A user's download action, immutable once dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub download_type: DownloadType,
    pub format_id: String,
    pub destination_folder: PathBuf,
    pub desired_title: String,
}

/// Progress of the current phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    /// 0-100, non-decreasing within a phase
    pub percent_complete: f64,
    /// MiB per second, one decimal
    pub transfer_rate_mbps: Option<f64>,
    pub eta: Option<String>,
}

/// Outcome of a successful calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub optimal_concurrency: u32,
    /// Peak MiB/s per tried concurrency level; failed trials are absent
    pub measured_speeds: BTreeMap<u32, f64>,
}

/// Audio re-encode post-step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioExtraction {
    pub codec: String,
    pub quality: String,
}

impl Default for AudioExtraction {
    fn default() -> Self {
        Self {
            codec: "mp3".to_string(),
            quality: "0".to_string(),
        }
    }
}

/// Options handed to the extractor for one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub url: String,
    /// yt-dlp format selector, e.g. "137+bestaudio"
    pub format_selector: String,
    pub merge_output_format: Option<String>,
    pub extract_audio: Option<AudioExtraction>,
    /// Output template passed to `-o`
    pub output_template: String,
    pub retries: u32,
    pub socket_timeout_secs: u32,
    pub concurrent_fragments: u32,
    /// Location of the ffmpeg executable (plain configuration value)
    pub muxer_location: Option<PathBuf>,
    pub max_downloads: Option<u32>,
}
