// Downloader module - orchestration core around yt-dlp and ffmpeg

pub mod calibration;
pub mod errors;
pub mod events;
pub mod extractors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod tools;
pub mod traits;
pub mod utils;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{DownloadError, ValidationFailure};
pub use events::{CoreEvent, EventQueue, EventReceiver};
pub use format_selector::{FormatCatalog, FormatSelector};
pub use models::{
    CalibrationResult, DownloadRequest, DownloadType, FormatEntry, MediaInfo, Phase,
    ProgressSnapshot, StreamClass,
};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use traits::MediaExtractor;
