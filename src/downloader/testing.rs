// Scripted `MediaExtractor` and `PageResolver` for exercising the core
// without yt-dlp or network access

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::extractors::DirectMedia;
use super::models::{DownloadJob, MediaInfo};
use super::progress::ToolEvent;
use super::traits::{MediaExtractor, PageResolver};

/// What one fake transfer does
pub struct FakeRun {
    pub events: Vec<ToolEvent>,
    /// Extension of the file to create from the output template
    pub create_ext: Option<String>,
    pub outcome: Result<(), DownloadError>,
    /// Block until cancelled after sending the events
    pub hang: bool,
}

impl FakeRun {
    pub fn ok(events: Vec<ToolEvent>) -> Self {
        Self {
            events,
            create_ext: None,
            outcome: Ok(()),
            hang: false,
        }
    }

    pub fn failing(error: DownloadError) -> Self {
        Self {
            events: Vec::new(),
            create_ext: None,
            outcome: Err(error),
            hang: false,
        }
    }

    pub fn hanging(events: Vec<ToolEvent>) -> Self {
        Self {
            events,
            create_ext: None,
            outcome: Ok(()),
            hang: true,
        }
    }

    pub fn creating(mut self, ext: &str) -> Self {
        self.create_ext = Some(ext.to_string());
        self
    }
}

type ProbeFn = dyn Fn(&str) -> (Duration, Result<MediaInfo, DownloadError>) + Send + Sync;
type DownloadFn = dyn Fn(&DownloadJob) -> FakeRun + Send + Sync;

pub struct ScriptedExtractor {
    probe: Box<ProbeFn>,
    download: Box<DownloadFn>,
    downloads: AtomicUsize,
    jobs: Mutex<Vec<DownloadJob>>,
}

impl ScriptedExtractor {
    pub fn new<P, D>(probe: P, download: D) -> Self
    where
        P: Fn(&str) -> (Duration, Result<MediaInfo, DownloadError>) + Send + Sync + 'static,
        D: Fn(&DownloadJob) -> FakeRun + Send + Sync + 'static,
    {
        Self {
            probe: Box::new(probe),
            download: Box::new(download),
            downloads: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_download<D>(download: D) -> Self
    where
        D: Fn(&DownloadJob) -> FakeRun + Send + Sync + 'static,
    {
        Self::new(
            |_| (Duration::ZERO, Err(DownloadError::NoFormats)),
            download,
        )
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaExtractor for ScriptedExtractor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, DownloadError> {
        let (delay, result) = (self.probe)(url);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn download(
        &self,
        job: DownloadJob,
        progress: UnboundedSender<ToolEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job.clone());
        let run = (self.download)(&job);

        for event in run.events {
            let _ = progress.send(event);
            tokio::task::yield_now().await;
        }

        if let Some(ext) = &run.create_ext {
            let path = PathBuf::from(job.output_template.replace("%(ext)s", ext));
            std::fs::write(&path, b"media")?;
        }

        if run.hang {
            cancel.cancelled().await;
            return Err(DownloadError::Cancelled);
        }

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        run.outcome
    }
}

/// Answers every handled URL with the same page contents
pub struct ScriptedResolver {
    host: String,
    media: Result<DirectMedia, DownloadError>,
    lookups: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(host: &str, media: Result<DirectMedia, DownloadError>) -> Self {
        Self {
            host: host.to_string(),
            media,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageResolver for ScriptedResolver {
    fn handles(&self, url: &str) -> bool {
        url.contains(&self.host)
    }

    async fn resolve(&self, _url: &str) -> Result<DirectMedia, DownloadError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.media.clone()
    }
}
