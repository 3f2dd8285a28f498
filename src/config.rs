// Runtime configuration and persisted user settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::downloader::DownloadError;

/// Fragment concurrency used until a calibration succeeds
pub const DEFAULT_CONCURRENCY: u32 = 3;

const SETTINGS_FILE: &str = ".yt_downloader_config.ini";
const SETTINGS_SECTION: &str = "Settings";
const KEY_FOLDER: &str = "download_folder";
const KEY_CONCURRENCY: &str = "concurrent_fragments";

/// Short public videos used for calibration trials
pub const DEFAULT_CALIBRATION_SAMPLES: &[&str] = &[
    "https://www.youtube.com/watch?v=BaW_jenozKc",
    "https://www.youtube.com/watch?v=jNQXAC9IVRw",
    "https://www.youtube.com/watch?v=C0DPdy98e4c",
];

/// Knobs of the orchestration core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Explicit yt-dlp executable; searched for when absent
    pub ytdlp_path: Option<PathBuf>,
    /// Explicit ffmpeg executable; searched for when absent
    pub ffmpeg_path: Option<PathBuf>,
    pub socket_timeout_secs: u32,
    pub retries: u32,
    pub probe_timeout_secs: u64,
    /// Free space required before a download is accepted; 0 disables the check
    pub min_free_bytes: u64,
    /// Time between the polite terminate and the hard kill
    pub cancel_grace: Duration,
    /// Concurrency levels tried by calibration, in order
    pub calibration_levels: Vec<u32>,
    pub calibration_samples: Vec<String>,
    /// Upper bound on a single calibration trial
    pub calibration_trial_timeout: Duration,
    /// Parent of calibration scratch directories
    pub scratch_root: PathBuf,
    pub settings_path: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            ffmpeg_path: None,
            socket_timeout_secs: 30,
            retries: 5,
            probe_timeout_secs: 60,
            min_free_bytes: 1024 * 1024 * 1024,
            cancel_grace: Duration::from_millis(500),
            calibration_levels: vec![1, 3, 5, 8, 10],
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            calibration_trial_timeout: Duration::from_secs(20),
            scratch_root: std::env::temp_dir(),
            settings_path: default_settings_path(),
        }
    }
}

impl CoreConfig {
    /// Defaults with `YTDL_CORE_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("YTDL_CORE_YTDLP") {
            if !path.trim().is_empty() {
                config.ytdlp_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(path) = std::env::var("YTDL_CORE_FFMPEG") {
            if !path.trim().is_empty() {
                config.ffmpeg_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(mb) = std::env::var("YTDL_CORE_MIN_FREE_MB") {
            match mb.trim().parse::<u64>() {
                Ok(mb) => config.min_free_bytes = mb * 1024 * 1024,
                Err(e) => tracing::warn!("[Config] Ignoring YTDL_CORE_MIN_FREE_MB={}: {}", mb, e),
            }
        }

        config
    }
}

/// `~/.yt_downloader_config.ini`, or the working directory without a home
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SETTINGS_FILE)
}

/// Values that survive restarts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub download_folder: Option<PathBuf>,
    /// Always >= 1
    pub concurrent_fragments: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_folder: None,
            concurrent_fragments: DEFAULT_CONCURRENCY,
        }
    }
}

/// INI-style settings file with a single `[Settings]` section
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files yield defaults
    pub fn load(&self) -> Settings {
        match fs::read_to_string(&self.path) {
            Ok(text) => parse_settings(&text),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!("[Config] Error loading {}: {}", self.path.display(), e);
                }
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), DownloadError> {
        if settings.concurrent_fragments == 0 {
            return Err(DownloadError::Parse(
                "concurrent_fragments must be positive".to_string(),
            ));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut text = format!("[{}]\n", SETTINGS_SECTION);
        if let Some(folder) = &settings.download_folder {
            text.push_str(&format!("{} = {}\n", KEY_FOLDER, folder.display()));
        }
        text.push_str(&format!("{} = {}\n\n", KEY_CONCURRENCY, settings.concurrent_fragments));

        fs::write(&self.path, text)?;
        hide_file(&self.path);
        tracing::debug!("[Config] Saved settings to {}", self.path.display());
        Ok(())
    }

    pub fn set_concurrency(&self, value: u32) -> Result<(), DownloadError> {
        let mut settings = self.load();
        settings.concurrent_fragments = value;
        self.save(&settings)
    }

    pub fn set_download_folder(&self, folder: impl Into<PathBuf>) -> Result<(), DownloadError> {
        let mut settings = self.load();
        settings.download_folder = Some(folder.into());
        self.save(&settings)
    }
}

fn parse_settings(text: &str) -> Settings {
    let mut settings = Settings::default();
    let mut in_section = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_section = line[1..line.len() - 1].trim() == SETTINGS_SECTION;
            continue;
        }
        if !in_section {
            continue;
        }

        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            KEY_FOLDER if !value.is_empty() => {
                settings.download_folder = Some(PathBuf::from(value));
            }
            KEY_CONCURRENCY => match value.parse::<u32>() {
                Ok(n) if n >= 1 => settings.concurrent_fragments = n,
                _ => tracing::warn!("[Config] Ignoring invalid {} = {}", KEY_CONCURRENCY, value),
            },
            _ => {}
        }
    }

    settings
}

#[cfg(windows)]
fn hide_file(path: &Path) {
    let result = std::process::Command::new("attrib")
        .arg("+h")
        .arg(path)
        .output();
    if let Err(e) = result {
        tracing::warn!("[Config] Could not hide {}: {}", path.display(), e);
    }
}

#[cfg(not(windows))]
fn hide_file(_path: &Path) {}
