// Extractor trait definitions

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::extractors::DirectMedia;
use super::models::{DownloadJob, MediaInfo};
use super::progress::ToolEvent;

/// Trait for the external media extraction tool
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Name of the extractor (for logging)
    fn name(&self) -> &'static str;

    /// Fetch metadata and the raw format list for a URL
    async fn probe(&self, url: &str) -> Result<MediaInfo, DownloadError>;

    /// Run one transfer, streaming progress into `progress`.
    ///
    /// Must return `Err(DownloadError::Cancelled)` promptly once `cancel`
    /// fires, after the underlying process is gone.
    async fn download(
        &self,
        job: DownloadJob,
        progress: UnboundedSender<ToolEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError>;
}

/// Page-level media lookup for hosts the extractor handles poorly
#[async_trait]
pub trait PageResolver: Send + Sync {
    /// Whether fetches for `url` should try the page first
    fn handles(&self, url: &str) -> bool;

    async fn resolve(&self, url: &str) -> Result<DirectMedia, DownloadError>;
}
