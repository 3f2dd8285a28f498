// Orchestrator - owns the session state and runs fetch, download and calibration
//
// Every public operation returns immediately; the work runs on the tokio
// runtime captured at construction and reports back only through the event
// queue. At most one download or one calibration is active at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::calibration::{Calibrator, SCRATCH_PREFIX};
use super::errors::DownloadError;
use super::events::{CoreEvent, EventQueue, EventReceiver};
use super::extractors::{DirectMediaResolver, YtDlpCli};
use super::format_selector::{FormatCatalog, FormatSelector};
use super::models::{
    AudioExtraction, DownloadJob, DownloadRequest, DownloadType, FormatEntry, Phase, StreamClass,
};
use super::progress::{PhaseTracker, ToolEvent};
use super::tools::{ToolKind, ToolManager};
use super::traits::{MediaExtractor, PageResolver};
use super::utils::sanitize_filename;
use super::validator::validate_destination;
use crate::config::{CoreConfig, SettingsStore};

/// Externally visible lifecycle of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Fetching,
    FormatsReady,
    Starting,
    Downloading(Phase),
    Merging,
    Completed,
    Failed,
}

impl OrchestratorState {
    fn is_download_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Downloading(_) | Self::Merging)
    }
}

/// Mutual-exclusion flag between downloads and calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Idle,
    Downloading,
    Calibrating,
}

#[derive(Default)]
struct CatalogSlot {
    class: Option<StreamClass>,
    catalog: Option<FormatCatalog>,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    state: Mutex<OrchestratorState>,
    catalog: Mutex<CatalogSlot>,
    fetch_generation: AtomicU64,
    activity: Mutex<Activity>,
    concurrency: AtomicU32,
}

impl Shared {
    fn state(&self) -> OrchestratorState {
        *lock(&self.state)
    }

    fn set_state(&self, state: OrchestratorState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!("[Orchestrator] {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Fetch results must not clobber the state of a running download
    fn set_fetch_state(&self, state: OrchestratorState) {
        let mut current = lock(&self.state);
        if !current.is_download_active() {
            *current = state;
        }
    }

    fn is_current_fetch(&self, generation: u64) -> bool {
        self.fetch_generation.load(Ordering::SeqCst) == generation
    }
}

/// Releases the activity flag even if the owning task unwinds
struct ActivityGuard {
    shared: Arc<Shared>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        *lock(&self.shared.activity) = Activity::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything needed to run and finish one download
#[derive(Debug, Clone)]
struct DownloadPlan {
    job: DownloadJob,
    phases: Vec<Phase>,
    folder: PathBuf,
    base_filename: String,
    expected_path: PathBuf,
}

impl DownloadPlan {
    fn build(
        request: &DownloadRequest,
        entry: &FormatEntry,
        config: &CoreConfig,
        concurrency: u32,
    ) -> Self {
        let audio = request.download_type == DownloadType::AudioOnly;
        let mut merge_output_format = None;
        let mut extract_audio = None;

        let (url, format_selector, extension, video_only, phases) = match entry.direct_url() {
            Some(direct) if audio => {
                extract_audio = Some(AudioExtraction::default());
                (direct.to_string(), "best".to_string(), "mp3".to_string(), false, vec![Phase::Audio])
            }
            Some(direct) => (
                direct.to_string(),
                "best".to_string(),
                entry.extension.clone(),
                true,
                vec![Phase::Video],
            ),
            None => match request.download_type {
                DownloadType::VideoAndAudio => {
                    merge_output_format = Some("mp4".to_string());
                    (
                        request.url.clone(),
                        format!("{}+bestaudio", entry.format_id),
                        "mp4".to_string(),
                        false,
                        request.download_type.phases(),
                    )
                }
                DownloadType::VideoOnly => (
                    request.url.clone(),
                    entry.format_id.clone(),
                    entry.extension.clone(),
                    true,
                    request.download_type.phases(),
                ),
                DownloadType::AudioOnly => {
                    extract_audio = Some(AudioExtraction::default());
                    (
                        request.url.clone(),
                        entry.format_id.clone(),
                        "mp3".to_string(),
                        false,
                        request.download_type.phases(),
                    )
                }
            },
        };

        let title = match request.desired_title.trim() {
            "" => "Untitled Video",
            t => t,
        };
        let suffix = if video_only { " [Video only]" } else { "" };
        let base_filename = sanitize_filename(&format!("{} - {}{}", title, entry.format_part(), suffix));

        let folder = request.destination_folder.clone();
        let expected_path = folder.join(format!("{}.{}", base_filename, extension));
        // `%` starts a template field in yt-dlp output names
        let output_template = folder
            .join(format!("{}.%(ext)s", base_filename.replace('%', "%%")))
            .to_string_lossy()
            .to_string();

        Self {
            job: DownloadJob {
                url,
                format_selector,
                merge_output_format,
                extract_audio,
                output_template,
                retries: config.retries,
                socket_timeout_secs: config.socket_timeout_secs,
                concurrent_fragments: concurrency,
                muxer_location: config.ffmpeg_path.clone(),
                max_downloads: None,
            },
            phases,
            folder,
            base_filename,
            expected_path,
        }
    }
}

/// Session object driving the external tools
pub struct Orchestrator {
    config: CoreConfig,
    extractor: Arc<dyn MediaExtractor>,
    resolver: Option<Arc<dyn PageResolver>>,
    settings: Arc<SettingsStore>,
    queue: EventQueue,
    runtime: Handle,
    shared: Arc<Shared>,
    running: Mutex<Option<RunningTask>>,
    fetches: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime
    pub fn new(
        config: CoreConfig,
        extractor: Arc<dyn MediaExtractor>,
        resolver: Option<Arc<dyn PageResolver>>,
    ) -> Result<(Self, EventReceiver), DownloadError> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloadError::Io(format!("No tokio runtime available: {}", e)))?;

        let settings = Arc::new(SettingsStore::new(config.settings_path.clone()));
        let concurrency = settings.load().concurrent_fragments;
        tracing::info!(
            "[Orchestrator] Using {} with concurrency {}",
            extractor.name(),
            concurrency
        );

        let (queue, receiver) = EventQueue::new();
        let orchestrator = Self {
            config,
            extractor,
            resolver,
            settings,
            queue,
            runtime,
            shared: Arc::new(Shared {
                state: Mutex::new(OrchestratorState::Idle),
                catalog: Mutex::new(CatalogSlot::default()),
                fetch_generation: AtomicU64::new(0),
                activity: Mutex::new(Activity::Idle),
                concurrency: AtomicU32::new(concurrency),
            }),
            running: Mutex::new(None),
            fetches: Mutex::new(Vec::new()),
        };
        Ok((orchestrator, receiver))
    }

    /// Production wiring: yt-dlp CLI plus the direct page resolver
    pub fn with_defaults(mut config: CoreConfig) -> Result<(Self, EventReceiver), DownloadError> {
        let tools = ToolManager::new(config.ytdlp_path.clone(), config.ffmpeg_path.clone());
        if config.ffmpeg_path.is_none() {
            config.ffmpeg_path = tools.locate(ToolKind::Ffmpeg);
        }
        let extractor = YtDlpCli::new(
            tools.program(ToolKind::YtDlp),
            config.probe_timeout_secs,
            config.socket_timeout_secs,
            config.cancel_grace,
        );
        let resolver = match DirectMediaResolver::new(config.socket_timeout_secs as u64) {
            Ok(resolver) => Some(Arc::new(resolver) as Arc<dyn PageResolver>),
            Err(e) => {
                tracing::warn!("[Orchestrator] Direct extraction disabled: {}", e);
                None
            }
        };
        Self::new(config, Arc::new(extractor), resolver)
    }

    pub fn state(&self) -> OrchestratorState {
        self.shared.state()
    }

    /// Fragment concurrency used for the next download
    pub fn concurrency(&self) -> u32 {
        self.shared.concurrency.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Entries of the current catalog, best first
    pub fn catalog_entries(&self) -> Vec<FormatEntry> {
        lock(&self.shared.catalog)
            .catalog
            .as_ref()
            .map(|c| c.entries().to_vec())
            .unwrap_or_default()
    }

    pub fn is_calibrating(&self) -> bool {
        *lock(&self.shared.activity) == Activity::Calibrating
    }

    pub fn is_downloading(&self) -> bool {
        *lock(&self.shared.activity) == Activity::Downloading
    }

    /// Probe `url` in the background and replace the catalog on success.
    ///
    /// Only the most recently started fetch may publish; older in-flight
    /// fetches finish silently apart from `enable_fetch`. A failed fetch
    /// leaves the previous catalog in place.
    pub fn fetch_formats(&self, url: &str, download_type: DownloadType) {
        let generation = {
            // Publishing checks the generation under the same lock
            let _slot = lock(&self.shared.catalog);
            self.shared.fetch_generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.shared.set_fetch_state(OrchestratorState::Fetching);

        let ctx = FetchContext {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            generation,
        };
        let extractor = self.extractor.clone();
        let resolver = self.resolver.clone();
        let url = url.trim().to_string();

        let handle = self.runtime.spawn(async move {
            tracing::info!("[Orchestrator] Fetching formats for {} ({:?})", url, download_type);
            match run_fetch(&ctx, extractor.as_ref(), resolver.as_deref(), &url, download_type).await {
                Ok(catalog) => {
                    if !ctx.publish(download_type.stream_class(), catalog) {
                        tracing::debug!("[Orchestrator] Dropping stale fetch result for {}", url);
                    }
                }
                Err(e) => {
                    tracing::error!("[Orchestrator] Fetch failed for {}: {}", url, e);
                    ctx.fail(e);
                }
            }
            ctx.queue.emit(CoreEvent::EnableFetch);
        });

        let mut fetches = lock(&self.fetches);
        fetches.retain(|h| !h.is_finished());
        fetches.push(handle);
    }

    /// Validate and dispatch a download.
    ///
    /// Errors are returned synchronously and leave no background work behind.
    pub fn start_download(&self, request: DownloadRequest) -> Result<(), DownloadError> {
        let mut activity = lock(&self.shared.activity);
        match *activity {
            Activity::Calibrating => return Err(DownloadError::CalibrationInProgress),
            Activity::Downloading => return Err(DownloadError::DownloadInProgress),
            Activity::Idle => {}
        }

        let plan = {
            let slot = lock(&self.shared.catalog);
            let entry = slot
                .catalog
                .as_ref()
                .filter(|_| slot.class == Some(request.download_type.stream_class()))
                .and_then(|c| c.resolve(&request.format_id))
                .ok_or_else(|| DownloadError::FormatNotAvailable(request.format_id.clone()))?;
            DownloadPlan::build(&request, entry, &self.config, self.concurrency())
        };

        validate_destination(&plan.folder, &plan.expected_path, self.config.min_free_bytes)
            .map_err(|failure| {
                tracing::warn!(
                    "[Orchestrator] Rejected {}: {}",
                    plan.expected_path.display(),
                    failure
                );
                DownloadError::Validation(failure)
            })?;

        *activity = Activity::Downloading;
        let guard = ActivityGuard {
            shared: self.shared.clone(),
        };
        drop(activity);

        tracing::info!(
            "[Orchestrator] Starting download: {} -> {}",
            plan.job.format_selector,
            plan.expected_path.display()
        );
        self.shared.set_state(OrchestratorState::Starting);
        let first = plan.phases[0];
        self.queue.status("Starting download...");
        self.queue.emit(CoreEvent::SetPhase(first));
        self.queue.emit(CoreEvent::StartPhase(first));
        self.shared.set_state(OrchestratorState::Downloading(first));

        let token = CancellationToken::new();
        let ctx = DownloadContext {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            extractor: self.extractor.clone(),
        };
        let handle = self.spawn_supervised(
            run_download(ctx, plan, token.clone(), guard),
            |e| vec![CoreEvent::DownloadError(e)],
        );
        *lock(&self.running) = Some(RunningTask { token, handle });
        Ok(())
    }

    /// Stop the running download or calibration; false when nothing runs
    pub fn cancel(&self) -> bool {
        let running = lock(&self.running);
        match running.as_ref() {
            Some(task) if !task.handle.is_finished() && !task.token.is_cancelled() => {
                tracing::info!("[Orchestrator] Cancel requested");
                task.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Measure throughput per concurrency level in the background
    pub fn start_calibration(&self) -> Result<(), DownloadError> {
        let mut activity = lock(&self.shared.activity);
        match *activity {
            Activity::Downloading => return Err(DownloadError::DownloadInProgress),
            Activity::Calibrating => return Err(DownloadError::CalibrationInProgress),
            Activity::Idle => {}
        }
        *activity = Activity::Calibrating;
        let guard = ActivityGuard {
            shared: self.shared.clone(),
        };
        drop(activity);

        self.queue.emit(CoreEvent::CalibrateStart);

        let token = CancellationToken::new();
        let calibrator = Calibrator::new(self.extractor.clone(), &self.config);
        let shared = self.shared.clone();
        let queue = self.queue.clone();
        let settings = self.settings.clone();
        let cancel = token.clone();

        let handle = self.spawn_supervised(
            async move {
                let previous = shared.concurrency.load(Ordering::SeqCst);
                let outcome = calibrator.run(&queue, cancel).await;

                let event = match outcome {
                    Ok(result) => {
                        shared
                            .concurrency
                            .store(result.optimal_concurrency, Ordering::SeqCst);
                        if let Err(e) = settings.set_concurrency(result.optimal_concurrency) {
                            tracing::error!("[Calibration] Could not persist result: {}", e);
                        }
                        tracing::info!(
                            "[Calibration] Optimal concurrency {}",
                            result.optimal_concurrency
                        );
                        CoreEvent::CalibrationResult(result)
                    }
                    Err(e) => {
                        shared.concurrency.store(previous, Ordering::SeqCst);
                        tracing::error!("[Calibration] {}; keeping {}", e, previous);
                        CoreEvent::CalibrationError(e)
                    }
                };

                drop(guard);
                queue.emit(event);
                queue.emit(CoreEvent::CalibrateEnd);
            },
            |e| vec![CoreEvent::CalibrationError(e), CoreEvent::CalibrateEnd],
        );
        *lock(&self.running) = Some(RunningTask { token, handle });
        Ok(())
    }

    /// Cancel outstanding work, wait for it and remove scratch directories
    pub async fn shutdown(&self) {
        tracing::info!("[Orchestrator] Shutting down");

        let running = lock(&self.running).take();
        if let Some(task) = running {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!("[Orchestrator] Task ended abnormally: {}", e);
            }
        }

        let fetches: Vec<JoinHandle<()>> = lock(&self.fetches).drain(..).collect();
        for handle in fetches {
            handle.abort();
        }

        remove_scratch_dirs(&self.config.scratch_root);
    }

    /// Run `work` as its own task; a panic becomes the closing events
    fn spawn_supervised<F, E>(&self, work: F, on_panic: E) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
        E: FnOnce(DownloadError) -> Vec<CoreEvent> + Send + 'static,
    {
        let queue = self.queue.clone();
        let shared = self.shared.clone();
        let inner = self.runtime.spawn(work);
        self.runtime.spawn(async move {
            if let Err(e) = inner.await {
                tracing::error!("[Orchestrator] Background task failed: {}", e);
                if shared.state().is_download_active() {
                    shared.set_state(OrchestratorState::Failed);
                }
                for event in on_panic(DownloadError::Io(format!("background task failed: {}", e))) {
                    queue.emit(event);
                }
            }
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.running).as_ref() {
            task.token.cancel();
        }
        for handle in lock(&self.fetches).iter() {
            handle.abort();
        }
    }
}

struct FetchContext {
    shared: Arc<Shared>,
    queue: EventQueue,
    generation: u64,
}

impl FetchContext {
    /// Emit only while this fetch is the newest. The catalog lock orders
    /// the check against `fetch_formats` bumping the generation.
    fn emit(&self, event: CoreEvent) {
        let _slot = lock(&self.shared.catalog);
        if self.shared.is_current_fetch(self.generation) {
            self.queue.emit(event);
        }
    }

    /// Install the catalog and announce it; false when superseded
    fn publish(&self, class: StreamClass, catalog: FormatCatalog) -> bool {
        let mut slot = lock(&self.shared.catalog);
        if !self.shared.is_current_fetch(self.generation) {
            return false;
        }
        let entries = catalog.entries().to_vec();
        *slot = CatalogSlot {
            class: Some(class),
            catalog: Some(catalog),
        };
        self.shared.set_fetch_state(OrchestratorState::FormatsReady);
        self.queue.emit(CoreEvent::Formats(entries));
        true
    }

    fn fail(&self, error: DownloadError) {
        let slot = lock(&self.shared.catalog);
        if !self.shared.is_current_fetch(self.generation) {
            return;
        }
        let fallback = if slot.catalog.is_some() {
            OrchestratorState::FormatsReady
        } else {
            OrchestratorState::Idle
        };
        self.shared.set_fetch_state(fallback);
        self.queue.emit(CoreEvent::Error(error));
    }
}

async fn run_fetch(
    ctx: &FetchContext,
    extractor: &dyn MediaExtractor,
    resolver: Option<&dyn PageResolver>,
    url: &str,
    download_type: DownloadType,
) -> Result<FormatCatalog, DownloadError> {
    if let Some(resolver) = resolver.filter(|r| r.handles(url)) {
        ctx.emit(CoreEvent::Status("Using direct page extraction for this URL...".to_string()));
        let media = resolver.resolve(url).await?;

        if media.is_empty() {
            tracing::warn!("[Orchestrator] Direct extraction found nothing, using {}", extractor.name());
            ctx.emit(CoreEvent::Status(
                "Direct extraction found no media, trying standard method...".to_string(),
            ));
        } else {
            if let Some(title) = &media.title {
                ctx.emit(CoreEvent::VideoTitle(title.clone()));
            }
            return FormatSelector::build_direct_catalog(&media, download_type);
        }
    }

    let info = extractor.probe(url).await?;
    let title = info
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled Video".to_string());
    ctx.emit(CoreEvent::VideoTitle(title));

    FormatSelector::build_catalog(&info.formats, download_type)
}

struct DownloadContext {
    shared: Arc<Shared>,
    queue: EventQueue,
    extractor: Arc<dyn MediaExtractor>,
}

/// Feeds tool events through the phase tracker into the queue
struct ProgressSink<'a> {
    ctx: &'a DownloadContext,
    tracker: PhaseTracker,
    reported_paths: Vec<PathBuf>,
}

impl ProgressSink<'_> {
    fn handle(&mut self, event: ToolEvent) {
        match &event {
            ToolEvent::Destination(path) => self.reported_paths.push(PathBuf::from(path)),
            ToolEvent::Finished {
                filename: Some(path),
            } => self.reported_paths.push(PathBuf::from(path)),
            _ => {}
        }

        for out in self.tracker.on_event(&event) {
            if let CoreEvent::StartPhase(phase) = &out {
                self.ctx.shared.set_state(match phase {
                    Phase::Merging => OrchestratorState::Merging,
                    other => OrchestratorState::Downloading(*other),
                });
            }
            self.ctx.queue.emit(out);
        }
    }
}

async fn run_download(
    ctx: DownloadContext,
    plan: DownloadPlan,
    token: CancellationToken,
    guard: ActivityGuard,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sink = ProgressSink {
        ctx: &ctx,
        tracker: PhaseTracker::new(plan.phases.clone()),
        reported_paths: Vec::new(),
    };

    let transfer = ctx.extractor.download(plan.job.clone(), tx, token);
    tokio::pin!(transfer);

    let result = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => sink.handle(event),
            res = &mut transfer => break res,
        }
    };
    while let Ok(event) = rx.try_recv() {
        sink.handle(event);
    }

    let merging = sink.tracker.is_merging();
    let outcome = result.and_then(|()| {
        locate_output(&plan, &sink.reported_paths).ok_or_else(|| {
            DownloadError::FileNotFoundAfterDownload(plan.expected_path.display().to_string())
        })
    });

    match outcome {
        Ok(path) => {
            let now = filetime::FileTime::now();
            if let Err(e) = filetime::set_file_mtime(&path, now) {
                tracing::warn!("[Orchestrator] Could not touch {}: {}", path.display(), e);
            }
            tracing::info!("[Orchestrator] Download complete: {}", path.display());
            ctx.shared.set_state(OrchestratorState::Completed);
            drop(guard);
            ctx.queue.emit(CoreEvent::DownloadComplete(path));
        }
        Err(e) => {
            tracing::error!("[Orchestrator] Download failed: {}", e);
            ctx.shared.set_state(OrchestratorState::Failed);
            drop(guard);
            if merging && !matches!(e, DownloadError::Cancelled | DownloadError::FileNotFoundAfterDownload(_)) {
                ctx.queue.emit(CoreEvent::MergeFailed(e.to_string()));
            }
            ctx.queue.emit(CoreEvent::DownloadError(e));
        }
    }
}

/// Expected name first, then paths the tool announced, then a prefix scan
fn locate_output(plan: &DownloadPlan, reported: &[PathBuf]) -> Option<PathBuf> {
    if plan.expected_path.is_file() {
        return Some(plan.expected_path.clone());
    }

    let matches_base = |path: &Path| {
        path.file_name()
            .map(|n| n.to_string_lossy().starts_with(&plan.base_filename))
            .unwrap_or(false)
    };

    if let Some(path) = reported
        .iter()
        .rev()
        .find(|p| p.is_file() && matches_base(p) && !is_partial(p))
    {
        tracing::info!("[Orchestrator] Found output via tool report: {}", path.display());
        return Some(path.clone());
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&plan.folder)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && matches_base(p) && !is_partial(p))
        .collect();
    candidates.sort();

    let found = candidates.into_iter().next();
    if let Some(path) = &found {
        tracing::info!("[Orchestrator] Found output via fallback search: {}", path.display());
    }
    found
}

fn is_partial(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("part") | Some("ytdl") | Some("temp")
    )
}

fn remove_scratch_dirs(root: &Path) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_scratch = path.is_dir()
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with(SCRATCH_PREFIX);
        if is_scratch {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::warn!("[Orchestrator] Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::extractors::DirectMedia;
    use crate::downloader::models::{MediaInfo, RawFormat};
    use crate::downloader::testing::{FakeRun, ScriptedExtractor, ScriptedResolver};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        out: PathBuf,
        config: CoreConfig,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let config = CoreConfig {
            min_free_bytes: 0,
            scratch_root: scratch,
            settings_path: tmp.path().join("settings.ini"),
            calibration_trial_timeout: Duration::from_secs(2),
            ..CoreConfig::default()
        };
        Fixture {
            _tmp: tmp,
            out,
            config,
        }
    }

    fn media() -> MediaInfo {
        MediaInfo {
            id: "abc".to_string(),
            title: Some("Song".to_string()),
            webpage_url: None,
            formats: vec![
                RawFormat {
                    format_id: "140".to_string(),
                    ext: "m4a".to_string(),
                    vcodec: Some("none".to_string()),
                    acodec: Some("mp4a.40.2".to_string()),
                    abr: Some(129.5),
                    filesize: Some(3_000_000),
                    ..Default::default()
                },
                RawFormat {
                    format_id: "137".to_string(),
                    ext: "mp4".to_string(),
                    height: Some(1080),
                    fps: Some(30.0),
                    vcodec: Some("avc1".to_string()),
                    acodec: Some("none".to_string()),
                    filesize: Some(90_000_000),
                    ..Default::default()
                },
            ],
        }
    }

    fn probing<D>(download: D) -> Arc<ScriptedExtractor>
    where
        D: Fn(&DownloadJob) -> FakeRun + Send + Sync + 'static,
    {
        Arc::new(ScriptedExtractor::new(|_| (Duration::ZERO, Ok(media())), download))
    }

    fn request(out: &Path, download_type: DownloadType, format_id: &str) -> DownloadRequest {
        DownloadRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            download_type,
            format_id: format_id.to_string(),
            destination_folder: out.to_path_buf(),
            desired_title: "Song".to_string(),
        }
    }

    fn percent(done: u64) -> ToolEvent {
        ToolEvent::Downloading {
            downloaded_bytes: done,
            total_bytes: Some(100),
            speed_bps: Some(2_097_152.0),
            eta: Some("00:05".to_string()),
        }
    }

    fn finished() -> ToolEvent {
        ToolEvent::Finished { filename: None }
    }

    async fn next_matching<F>(rx: &mut EventReceiver, mut pred: F) -> Vec<CoreEvent>
    where
        F: FnMut(&CoreEvent) -> bool,
    {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                let done = pred(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for events");
        seen
    }

    async fn fetched(
        orchestrator: &Orchestrator,
        rx: &mut EventReceiver,
        download_type: DownloadType,
    ) -> Vec<CoreEvent> {
        orchestrator.fetch_formats("https://www.youtube.com/watch?v=abc", download_type);
        next_matching(rx, |e| matches!(e, CoreEvent::EnableFetch)).await
    }

    #[tokio::test]
    async fn test_fetch_publishes_title_and_formats() {
        let fx = fixture();
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), probing(|_| FakeRun::ok(vec![])), None).unwrap();

        let events = fetched(&orch, &mut rx, DownloadType::AudioOnly).await;
        let tags: Vec<&str> = events.iter().map(|e| e.tag()).collect();
        assert_eq!(tags, vec!["video_title", "formats", "enable_fetch"]);
        assert_eq!(events[0], CoreEvent::VideoTitle("Song".to_string()));
        assert_eq!(orch.state(), OrchestratorState::FormatsReady);
        assert_eq!(orch.catalog_entries().len(), 1);
        assert_eq!(orch.catalog_entries()[0].format_id, "140");
    }

    #[tokio::test]
    async fn test_fetch_error_reenables_fetch() {
        let fx = fixture();
        let extractor = Arc::new(ScriptedExtractor::new(
            |_| (Duration::ZERO, Err(DownloadError::UnsupportedUrl("nope".to_string()))),
            |_| FakeRun::ok(vec![]),
        ));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();

        let events = fetched(&orch, &mut rx, DownloadType::VideoOnly).await;
        assert_eq!(
            events,
            vec![
                CoreEvent::Error(DownloadError::UnsupportedUrl("nope".to_string())),
                CoreEvent::EnableFetch
            ]
        );
        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert!(orch.catalog_entries().is_empty());
    }

    #[tokio::test]
    async fn test_stale_fetch_cannot_overwrite_newer_catalog() {
        let fx = fixture();
        let extractor = Arc::new(ScriptedExtractor::new(
            |url| {
                if url.ends_with("slow") {
                    let mut info = media();
                    info.title = Some("Old".to_string());
                    (Duration::from_millis(300), Ok(info))
                } else {
                    (Duration::ZERO, Ok(media()))
                }
            },
            |_| FakeRun::ok(vec![]),
        ));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();

        orch.fetch_formats("https://example.com/slow", DownloadType::VideoOnly);
        orch.fetch_formats("https://example.com/fast", DownloadType::AudioOnly);

        let mut enables = 0;
        let events = next_matching(&mut rx, |e| {
            if matches!(e, CoreEvent::EnableFetch) {
                enables += 1;
            }
            enables == 2
        })
        .await;

        assert!(!events.contains(&CoreEvent::VideoTitle("Old".to_string())));
        let formats: Vec<&CoreEvent> = events.iter().filter(|e| e.tag() == "formats").collect();
        assert_eq!(formats.len(), 1);
        assert_eq!(orch.catalog_entries()[0].format_id, "140");
    }

    #[tokio::test]
    async fn test_audio_only_download_completes() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::ok(vec![percent(10), percent(55), finished()]).creating("mp3"));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        let label = orch.catalog_entries()[0].display_label.clone();
        orch.start_download(request(&fx.out, DownloadType::AudioOnly, &label)).unwrap();
        assert!(orch.is_downloading());

        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        let events: Vec<CoreEvent> = events.into_iter().filter(|e| e.tag() != "status").collect();

        let expected_path = fx.out.join("Song - 129.5 kbps.mp3");
        assert_eq!(events[0], CoreEvent::SetPhase(Phase::Audio));
        assert_eq!(events[1], CoreEvent::StartPhase(Phase::Audio));
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Progress(p) => Some(p.percent_complete),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![10.0, 55.0]);
        assert!(events.contains(&CoreEvent::StartPhase(Phase::Merging)));
        assert_eq!(events.last(), Some(&CoreEvent::DownloadComplete(expected_path.clone())));
        assert_eq!(orch.state(), OrchestratorState::Completed);
        assert!(!orch.is_downloading());

        let job = &extractor.jobs()[0];
        assert_eq!(job.format_selector, "140");
        assert!(job.extract_audio.is_some());
        assert_eq!(job.concurrent_fragments, 3);
    }

    #[tokio::test]
    async fn test_rate_is_reported_in_mib() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::ok(vec![percent(50)]).creating("mp3"));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        let snapshot = events
            .iter()
            .find_map(|e| match e {
                CoreEvent::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.transfer_rate_mbps, Some(2.0));
        assert_eq!(snapshot.eta.as_deref(), Some("00:05"));
    }

    #[tokio::test]
    async fn test_video_and_audio_plan() {
        let fx = fixture();
        let extractor = probing(|_| {
            FakeRun::ok(vec![percent(100), finished(), percent(100), finished()]).creating("mp4")
        });
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();
        fetched(&orch, &mut rx, DownloadType::VideoAndAudio).await;

        orch.start_download(request(&fx.out, DownloadType::VideoAndAudio, "137")).unwrap();
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;

        let starts: Vec<Phase> = events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::StartPhase(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![Phase::Video, Phase::Audio, Phase::Merging]);
        assert_eq!(
            events.last(),
            Some(&CoreEvent::DownloadComplete(fx.out.join("Song - 1080p (30fps).mp4")))
        );

        let job = &extractor.jobs()[0];
        assert_eq!(job.format_selector, "137+bestaudio");
        assert_eq!(job.merge_output_format.as_deref(), Some("mp4"));
    }

    #[tokio::test]
    async fn test_video_only_found_by_prefix_scan() {
        let fx = fixture();
        // Tool produced a different container than the catalog advertised
        let extractor = probing(|_| FakeRun::ok(vec![finished()]).creating("webm"));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::VideoOnly).await;

        orch.start_download(request(&fx.out, DownloadType::VideoOnly, "137")).unwrap();
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        assert_eq!(
            events.last(),
            Some(&CoreEvent::DownloadComplete(
                fx.out.join("Song - 1080p (30fps) [Video only].webm")
            ))
        );
    }

    #[tokio::test]
    async fn test_missing_output_is_reported() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::ok(vec![finished()]));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        assert!(matches!(
            events.last(),
            Some(CoreEvent::DownloadError(DownloadError::FileNotFoundAfterDownload(_)))
        ));
        assert!(!events.iter().any(|e| e.tag() == "merge_failed"));
        assert_eq!(orch.state(), OrchestratorState::Failed);
    }

    #[tokio::test]
    async fn test_merge_failure_precedes_download_error() {
        let fx = fixture();
        let extractor = probing(|_| {
            let mut run = FakeRun::failing(DownloadError::ExternalTool {
                code: Some(1),
                message: "ERROR: Postprocessing: ffmpeg exited with code 1".to_string(),
            });
            run.events = vec![percent(100), finished()];
            run
        });
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        let tail: Vec<&str> = events.iter().rev().take(2).map(|e| e.tag()).collect();
        assert_eq!(tail, vec!["download_error", "merge_failed"]);
    }

    #[tokio::test]
    async fn test_unknown_format_is_rejected() {
        let fx = fixture();
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), probing(|_| FakeRun::ok(vec![])), None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        let err = orch
            .start_download(request(&fx.out, DownloadType::AudioOnly, "999"))
            .unwrap_err();
        assert_eq!(err, DownloadError::FormatNotAvailable("999".to_string()));

        // Catalog was built for audio; a video request cannot use it
        let err = orch
            .start_download(request(&fx.out, DownloadType::VideoOnly, "140"))
            .unwrap_err();
        assert!(matches!(err, DownloadError::FormatNotAvailable(_)));
        assert!(!orch.is_downloading());
    }

    #[tokio::test]
    async fn test_existing_file_blocks_dispatch() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::ok(vec![]).creating("mp3"));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        std::fs::create_dir_all(&fx.out).unwrap();
        std::fs::write(fx.out.join("Song - 129.5 kbps.mp3"), b"old").unwrap();

        let err = orch
            .start_download(request(&fx.out, DownloadType::AudioOnly, "140"))
            .unwrap_err();
        assert_eq!(
            err,
            DownloadError::Validation(crate::downloader::ValidationFailure::FileAlreadyExists)
        );
        assert!(!orch.is_downloading());
        assert_eq!(extractor.download_count(), 0);
        assert!(rx.drain().is_empty());
    }

    #[tokio::test]
    async fn test_second_download_is_refused_while_running() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::hanging(vec![percent(5)]));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();
        let err = orch
            .start_download(request(&fx.out, DownloadType::AudioOnly, "140"))
            .unwrap_err();
        assert_eq!(err, DownloadError::DownloadInProgress);
        assert_eq!(orch.start_calibration().unwrap_err(), DownloadError::DownloadInProgress);

        assert!(orch.cancel());
        next_matching(&mut rx, |e| e.is_download_terminal()).await;
    }

    #[tokio::test]
    async fn test_cancel_reaches_terminal_state() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::hanging(vec![percent(20)]));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();
        next_matching(&mut rx, |e| matches!(e, CoreEvent::Progress(_))).await;

        assert!(orch.cancel());
        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        assert_eq!(events.last(), Some(&CoreEvent::DownloadError(DownloadError::Cancelled)));
        assert_eq!(orch.state(), OrchestratorState::Failed);
        assert!(!orch.is_downloading());
        assert!(!orch.cancel());
    }

    #[tokio::test]
    async fn test_download_refused_while_calibrating() {
        let fx = fixture();
        let extractor = probing(|job| {
            if job.max_downloads.is_some() {
                FakeRun::hanging(Vec::new())
            } else {
                FakeRun::ok(Vec::new()).creating("mp3")
            }
        });
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;

        orch.start_calibration().unwrap();
        assert!(orch.is_calibrating());
        let err = orch
            .start_download(request(&fx.out, DownloadType::AudioOnly, "140"))
            .unwrap_err();
        assert_eq!(err, DownloadError::CalibrationInProgress);
        assert_eq!(orch.start_calibration().unwrap_err(), DownloadError::CalibrationInProgress);
        // Nothing touched the destination
        assert!(!fx.out.exists());

        assert!(orch.cancel());
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::CalibrateEnd)).await;
        assert!(events.contains(&CoreEvent::CalibrationError(DownloadError::Cancelled)));
        assert!(!orch.is_calibrating());
        assert_eq!(orch.concurrency(), 3);
    }

    #[tokio::test]
    async fn test_failed_calibration_keeps_previous_concurrency() {
        let fx = fixture();
        SettingsStore::new(fx.config.settings_path.clone())
            .set_concurrency(4)
            .unwrap();
        let before = std::fs::read_to_string(&fx.config.settings_path).unwrap();

        let extractor = probing(|_| FakeRun::failing(DownloadError::Network("reset".to_string())));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();
        assert_eq!(orch.concurrency(), 4);

        orch.start_calibration().unwrap();
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::CalibrateEnd)).await;

        assert_eq!(events[0], CoreEvent::CalibrateStart);
        assert!(events
            .iter()
            .any(|e| matches!(e, CoreEvent::CalibrationError(DownloadError::CalibrationFailed(_)))));
        assert_eq!(extractor.download_count(), 5);
        assert_eq!(orch.concurrency(), 4);
        assert_eq!(std::fs::read_to_string(&fx.config.settings_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_calibration_result_survives_restart() {
        let fx = fixture();
        let extractor = probing(|job| {
            let speed = if job.concurrent_fragments == 8 { 8.0 } else { 1.0 };
            FakeRun::ok(vec![ToolEvent::Downloading {
                downloaded_bytes: 1,
                total_bytes: None,
                speed_bps: Some(speed * 1_048_576.0),
                eta: None,
            }])
        });
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor.clone(), None).unwrap();

        orch.start_calibration().unwrap();
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::CalibrateEnd)).await;
        let result = events
            .iter()
            .find_map(|e| match e {
                CoreEvent::CalibrationResult(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.optimal_concurrency, 8);
        assert_eq!(orch.concurrency(), 8);
        drop(orch);

        let (restarted, _rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        assert_eq!(restarted.concurrency(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_cleans_scratch() {
        let fx = fixture();
        let leftover = fx.config.scratch_root.join(format!("{}old", SCRATCH_PREFIX));
        std::fs::create_dir_all(&leftover).unwrap();

        let extractor = probing(|_| FakeRun::hanging(Vec::new()));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;
        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), orch.shutdown())
            .await
            .unwrap();
        assert!(!leftover.exists());
        assert!(!orch.is_downloading());
        assert!(rx.drain().iter().any(|e| e.is_download_terminal()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_started_during_publish_wins() {
        let fx = fixture();
        let extractor = Arc::new(ScriptedExtractor::new(
            |url| {
                if url.ends_with("old") {
                    (Duration::from_millis(100), Ok(media()))
                } else {
                    (Duration::ZERO, Ok(media()))
                }
            },
            |_| FakeRun::ok(vec![]),
        ));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        let orch = Arc::new(orch);

        orch.fetch_formats("https://example.com/old", DownloadType::VideoOnly);
        std::thread::sleep(Duration::from_millis(20));

        // The old fetch finishes probing while the catalog is held, then a
        // newer fetch is requested before the lock is released
        let held = lock(&orch.shared.catalog);
        std::thread::sleep(Duration::from_millis(200));
        let newer = {
            let orch = orch.clone();
            std::thread::spawn(move || orch.fetch_formats("https://example.com/new", DownloadType::AudioOnly))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        newer.join().unwrap();

        let mut enables = 0;
        let events = next_matching(&mut rx, |e| {
            if matches!(e, CoreEvent::EnableFetch) {
                enables += 1;
            }
            enables == 2
        })
        .await;

        assert_eq!(orch.shared.fetch_generation.load(Ordering::SeqCst), 2);
        let ids: Vec<String> = orch.catalog_entries().into_iter().map(|e| e.format_id).collect();
        assert_eq!(ids, vec!["140".to_string()]);

        let last_formats = events
            .iter()
            .rev()
            .find_map(|e| match e {
                CoreEvent::Formats(entries) => Some(entries.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_formats, orch.catalog_entries());
        assert_eq!(orch.state(), OrchestratorState::FormatsReady);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_previous_catalog() {
        let fx = fixture();
        let extractor = Arc::new(ScriptedExtractor::new(
            |url| {
                if url.contains("broken") {
                    (Duration::ZERO, Err(DownloadError::Network("timed out".to_string())))
                } else {
                    (Duration::ZERO, Ok(media()))
                }
            },
            |_| FakeRun::ok(vec![]),
        ));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;
        assert_eq!(orch.catalog_entries().len(), 1);

        orch.fetch_formats("https://example.com/broken", DownloadType::AudioOnly);
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::EnableFetch)).await;

        assert!(events.iter().any(|e| e.tag() == "error"));
        assert_eq!(orch.catalog_entries().len(), 1);
        assert_eq!(orch.state(), OrchestratorState::FormatsReady);
        orch.start_download(request(&fx.out, DownloadType::AudioOnly, "140"))
            .unwrap();
        next_matching(&mut rx, |e| e.is_download_terminal()).await;
    }

    fn page_resolver(media: Result<DirectMedia, DownloadError>) -> Arc<ScriptedResolver> {
        Arc::new(ScriptedResolver::new("vimeo.com", media))
    }

    fn clip_page() -> DirectMedia {
        DirectMedia {
            title: Some("Clip".to_string()),
            video_urls: vec!["https://cdn.example.com/v/clip.mp4".to_string()],
            audio_urls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_page_media_becomes_direct_catalog() {
        let fx = fixture();
        let extractor = Arc::new(ScriptedExtractor::new(
            |_| (Duration::ZERO, Err(DownloadError::UnsupportedUrl("not probed".to_string()))),
            |_| FakeRun::ok(vec![]),
        ));
        let resolver = page_resolver(Ok(clip_page()));
        let (orch, mut rx) = Orchestrator::new(
            fx.config.clone(),
            extractor,
            Some(resolver.clone() as Arc<dyn PageResolver>),
        )
        .unwrap();

        orch.fetch_formats("https://vimeo.com/123", DownloadType::VideoOnly);
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::EnableFetch)).await;

        let tags: Vec<&str> = events.iter().map(|e| e.tag()).collect();
        assert_eq!(tags, vec!["status", "video_title", "formats", "enable_fetch"]);
        assert_eq!(events[1], CoreEvent::VideoTitle("Clip".to_string()));
        assert_eq!(resolver.lookup_count(), 1);

        let entries = orch.catalog_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].format_id, "direct:https://cdn.example.com/v/clip.mp4");
        assert!(entries[0].display_label.starts_with("Video (Direct) - "));
    }

    #[tokio::test]
    async fn test_empty_page_falls_back_to_extractor() {
        let fx = fixture();
        let resolver = page_resolver(Ok(DirectMedia::default()));
        let (orch, mut rx) = Orchestrator::new(
            fx.config.clone(),
            probing(|_| FakeRun::ok(vec![])),
            Some(resolver.clone() as Arc<dyn PageResolver>),
        )
        .unwrap();

        orch.fetch_formats("https://vimeo.com/123", DownloadType::VideoOnly);
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::EnableFetch)).await;

        let tags: Vec<&str> = events.iter().map(|e| e.tag()).collect();
        assert_eq!(tags, vec!["status", "status", "video_title", "formats", "enable_fetch"]);
        match &events[1] {
            CoreEvent::Status(text) => assert!(text.contains("trying standard method")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[2], CoreEvent::VideoTitle("Song".to_string()));
        assert_eq!(orch.catalog_entries()[0].format_id, "137");

        // Hosts outside the list never reach the page resolver
        fetched(&orch, &mut rx, DownloadType::AudioOnly).await;
        assert_eq!(resolver.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_direct_audio_download_extracts_mp3() {
        let fx = fixture();
        let extractor = probing(|_| FakeRun::ok(vec![percent(100), finished()]).creating("mp3"));
        let (orch, mut rx) = Orchestrator::new(
            fx.config.clone(),
            extractor.clone(),
            Some(page_resolver(Ok(clip_page())) as Arc<dyn PageResolver>),
        )
        .unwrap();

        orch.fetch_formats("https://vimeo.com/123", DownloadType::AudioOnly);
        next_matching(&mut rx, |e| matches!(e, CoreEvent::EnableFetch)).await;
        let entry = orch.catalog_entries()[0].clone();
        assert_eq!(entry.extension, "mp3");

        let mut req = request(&fx.out, DownloadType::AudioOnly, &entry.format_id);
        req.url = "https://vimeo.com/123".to_string();
        req.desired_title = "Clip".to_string();
        orch.start_download(req).unwrap();

        let events = next_matching(&mut rx, |e| e.is_download_terminal()).await;
        assert_eq!(
            events.last(),
            Some(&CoreEvent::DownloadComplete(fx.out.join("Clip - Audio (Direct).mp3")))
        );

        let job = &extractor.jobs()[0];
        assert_eq!(job.url, "https://cdn.example.com/v/clip.mp4");
        assert_eq!(job.format_selector, "best");
        assert_eq!(job.extract_audio, Some(AudioExtraction::default()));
        assert!(job.merge_output_format.is_none());
    }

    #[tokio::test]
    async fn test_panicking_calibration_still_ends() {
        let fx = fixture();
        let extractor = probing(|_| panic!("sample transfer exploded"));
        let (orch, mut rx) = Orchestrator::new(fx.config.clone(), extractor, None).unwrap();

        orch.start_calibration().unwrap();
        let events = next_matching(&mut rx, |e| matches!(e, CoreEvent::CalibrateEnd)).await;

        let tail: Vec<&str> = events.iter().rev().take(2).map(|e| e.tag()).collect();
        assert_eq!(tail, vec!["calibrate_end", "calibration_error"]);
        assert!(!orch.is_calibrating());
        assert_eq!(orch.concurrency(), 3);
    }

    #[test]
    fn test_plan_names_and_direct_urls() {
        let config = CoreConfig::default();
        let entry = FormatEntry {
            display_label: "Video (Direct) - https://cdn.example.com/v/cl...".to_string(),
            format_id: "direct:https://cdn.example.com/v/clip.mp4".to_string(),
            extension: "mp4".to_string(),
            sort_key: Default::default(),
        };
        let mut req = request(Path::new("/tmp/out"), DownloadType::VideoAndAudio, &entry.format_id);
        req.desired_title = "  A/B: 100% ".to_string();

        let plan = DownloadPlan::build(&req, &entry, &config, 6);
        assert_eq!(plan.job.url, "https://cdn.example.com/v/clip.mp4");
        assert_eq!(plan.job.format_selector, "best");
        assert_eq!(plan.phases, vec![Phase::Video]);
        assert_eq!(plan.base_filename, "A_B_ 100% - Video (Direct) [Video only]");
        assert!(plan.job.output_template.ends_with("A_B_ 100%% - Video (Direct) [Video only].%(ext)s"));
        assert_eq!(plan.job.concurrent_fragments, 6);
        assert_eq!(
            plan.expected_path,
            PathBuf::from("/tmp/out/A_B_ 100% - Video (Direct) [Video only].mp4")
        );
    }
}
