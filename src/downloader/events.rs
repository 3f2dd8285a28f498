// Event vocabulary and the queue that carries it to the consumer
//
// Background tasks (fetch, download, calibration) only ever talk to the outside
// world through `EventQueue`. The consumer owns the single `EventReceiver` and
// polls it on its own schedule.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::errors::DownloadError;
use super::models::{CalibrationResult, FormatEntry, Phase, ProgressSnapshot};

/// Everything the core can tell its consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Fresh catalog; replaces any previous list
    Formats(Vec<FormatEntry>),
    VideoTitle(String),
    /// Fetch failed
    Error(DownloadError),
    /// The fetch unit finished, successfully or not
    EnableFetch,
    /// A phase begins; progress display should reset
    StartPhase(Phase),
    /// Current phase for labelling subsequent progress
    SetPhase(Phase),
    Progress(ProgressSnapshot),
    /// Total size unknown; only raw bytes are available
    ProgressUnknown {
        phase: Phase,
        downloaded_bytes: u64,
        transfer_rate_mbps: Option<f64>,
    },
    DownloadComplete(PathBuf),
    DownloadError(DownloadError),
    /// Post-processing failed; always followed by `DownloadError`
    MergeFailed(String),
    CalibrateStart,
    CalibrateEnd,
    CalibrationProgress { percent: f64, concurrency: u32 },
    CalibrationResult(CalibrationResult),
    CalibrationError(DownloadError),
    /// Free-text notice
    Status(String),
}

impl CoreEvent {
    /// Stable payload tag
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Formats(_) => "formats",
            Self::VideoTitle(_) => "video_title",
            Self::Error(_) => "error",
            Self::EnableFetch => "enable_fetch",
            Self::StartPhase(_) => "start_phase",
            Self::SetPhase(_) => "set_phase",
            Self::Progress(_) => "progress",
            Self::ProgressUnknown { .. } => "progress_unknown",
            Self::DownloadComplete(_) => "download_complete",
            Self::DownloadError(_) => "download_error",
            Self::MergeFailed(_) => "merge_failed",
            Self::CalibrateStart => "calibrate_start",
            Self::CalibrateEnd => "calibrate_end",
            Self::CalibrationProgress { .. } => "calibration_progress",
            Self::CalibrationResult(_) => "calibration_result",
            Self::CalibrationError(_) => "calibration_error",
            Self::Status(_) => "status",
        }
    }

    /// True for the events that end a download request
    pub fn is_download_terminal(&self) -> bool {
        matches!(self, Self::DownloadComplete(_) | Self::DownloadError(_))
    }
}

/// Producer side; cheap to clone into every background task
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: UnboundedSender<CoreEvent>,
}

impl EventQueue {
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventReceiver { rx })
    }

    pub fn emit(&self, event: CoreEvent) {
        tracing::trace!("[Events] {}", event.tag());
        // A dropped receiver means nobody is listening anymore
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(CoreEvent::Status(message.into()));
    }
}

/// Single consumer side
#[derive(Debug)]
pub struct EventReceiver {
    rx: UnboundedReceiver<CoreEvent>,
}

impl EventReceiver {
    /// Non-blocking: next queued event, if any
    pub fn poll(&mut self) -> Option<CoreEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Non-blocking: everything queued right now, in order
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.poll() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event; `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        self.rx.recv().await
    }
}
