//! Download orchestration core for a yt-dlp based media downloader.
//!
//! Construct an [`Orchestrator`] inside a tokio runtime, issue fetch, download
//! and calibration requests, and poll the returned [`EventReceiver`] for
//! progress and results.

pub mod config;
pub mod downloader;
pub mod logging;

pub use config::{CoreConfig, Settings, SettingsStore};
pub use downloader::{
    CoreEvent, DownloadError, DownloadRequest, DownloadType, EventReceiver, FormatEntry,
    Orchestrator, OrchestratorState, Phase,
};
