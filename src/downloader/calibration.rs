// Calibration - picks the fragment concurrency with the best measured throughput
//
// One short sample video is downloaded once per candidate level into a scratch
// directory. Only the peak transfer rate of each trial matters; a trial that
// errors or never reports a rate is skipped, not fatal.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::events::{CoreEvent, EventQueue};
use super::models::{CalibrationResult, DownloadJob};
use super::progress::ToolEvent;
use super::traits::MediaExtractor;
use super::utils::bytes_per_sec_to_mbps;
use crate::config::CoreConfig;

/// Name prefix of calibration scratch directories
pub const SCRATCH_PREFIX: &str = "ytdl-calibration-";

pub struct Calibrator {
    extractor: Arc<dyn MediaExtractor>,
    levels: Vec<u32>,
    samples: Vec<String>,
    trial_timeout: Duration,
    scratch_root: PathBuf,
    socket_timeout_secs: u32,
    retries: u32,
    muxer_location: Option<PathBuf>,
}

/// What one trial produced
enum TrialOutcome {
    /// Peak rate in bytes per second
    Measured(f64),
    Failed(String),
}

impl Calibrator {
    pub fn new(extractor: Arc<dyn MediaExtractor>, config: &CoreConfig) -> Self {
        Self {
            extractor,
            levels: config.calibration_levels.clone(),
            samples: config.calibration_samples.clone(),
            trial_timeout: config.calibration_trial_timeout,
            scratch_root: config.scratch_root.clone(),
            socket_timeout_secs: config.socket_timeout_secs,
            retries: config.retries,
            muxer_location: config.ffmpeg_path.clone(),
        }
    }

    /// Run every trial and pick the winner.
    ///
    /// Ties keep the earlier (lower) level. The scratch directory is removed
    /// on every exit path.
    pub async fn run(
        &self,
        queue: &EventQueue,
        cancel: CancellationToken,
    ) -> Result<CalibrationResult, DownloadError> {
        let levels: Vec<u32> = self.levels.iter().copied().filter(|l| *l >= 1).collect();
        if levels.is_empty() {
            return Err(DownloadError::CalibrationFailed(
                "no concurrency levels configured".to_string(),
            ));
        }

        let sample = self
            .samples
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| DownloadError::CalibrationFailed("no sample URLs configured".to_string()))?;

        std::fs::create_dir_all(&self.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.scratch_root)?;
        tracing::info!(
            "[Calibration] Sample {} in {}",
            sample,
            scratch.path().display()
        );

        let mut measured_speeds = BTreeMap::new();
        let mut best: Option<(u32, f64)> = None;
        let mut cancelled = false;

        for (idx, level) in levels.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            queue.emit(CoreEvent::CalibrationProgress {
                percent: idx as f64 * 100.0 / levels.len() as f64,
                concurrency: level,
            });

            let trial_dir = scratch.path().join(format!("trial-{}", level));
            if let Err(e) = std::fs::create_dir_all(&trial_dir) {
                tracing::warn!("[Calibration] Level {}: scratch dir failed: {}", level, e);
                continue;
            }

            match self.run_trial(&sample, level, trial_dir, &cancel).await {
                TrialOutcome::Measured(peak) => {
                    tracing::info!(
                        "[Calibration] Level {}: peak {:.2} MiB/s",
                        level,
                        peak / 1_048_576.0
                    );
                    measured_speeds.insert(level, bytes_per_sec_to_mbps(peak));
                    if best.map_or(true, |(_, top)| peak > top) {
                        best = Some((level, peak));
                    }
                }
                TrialOutcome::Failed(reason) => {
                    tracing::warn!("[Calibration] Level {} failed: {}", level, reason);
                }
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if let Err(e) = scratch.close() {
            tracing::warn!("[Calibration] Could not remove scratch directory: {}", e);
        }

        if cancelled {
            return Err(DownloadError::Cancelled);
        }

        match best {
            Some((optimal_concurrency, _)) => {
                queue.emit(CoreEvent::CalibrationProgress {
                    percent: 100.0,
                    concurrency: optimal_concurrency,
                });
                Ok(CalibrationResult {
                    optimal_concurrency,
                    measured_speeds,
                })
            }
            None => Err(DownloadError::CalibrationFailed(format!(
                "all {} trials failed",
                levels.len()
            ))),
        }
    }

    async fn run_trial(
        &self,
        sample: &str,
        level: u32,
        trial_dir: PathBuf,
        cancel: &CancellationToken,
    ) -> TrialOutcome {
        let job = DownloadJob {
            url: sample.to_string(),
            format_selector: "best".to_string(),
            merge_output_format: None,
            extract_audio: None,
            output_template: trial_dir.join("%(id)s.%(ext)s").to_string_lossy().to_string(),
            retries: self.retries,
            socket_timeout_secs: self.socket_timeout_secs,
            concurrent_fragments: level,
            muxer_location: self.muxer_location.clone(),
            max_downloads: Some(1),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let trial_token = cancel.child_token();
        let transfer = self.extractor.download(job, tx, trial_token.clone());
        tokio::pin!(transfer);
        let deadline = tokio::time::sleep(self.trial_timeout);
        tokio::pin!(deadline);

        let mut peak = 0.0_f64;
        let mut timed_out = false;

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => record_peak(&mut peak, &event),
                res = &mut transfer => break res,
                _ = &mut deadline, if !timed_out => {
                    // Bounded trial: stop the transfer, keep what was measured
                    timed_out = true;
                    trial_token.cancel();
                }
            }
        };
        while let Ok(event) = rx.try_recv() {
            record_peak(&mut peak, &event);
        }

        match result {
            Ok(()) => {}
            Err(DownloadError::Cancelled) if timed_out && !cancel.is_cancelled() => {}
            Err(e) => return TrialOutcome::Failed(e.to_string()),
        }

        if peak > 0.0 {
            TrialOutcome::Measured(peak)
        } else {
            TrialOutcome::Failed("no transfer rate reported".to_string())
        }
    }
}

fn record_peak(peak: &mut f64, event: &ToolEvent) {
    if let ToolEvent::Downloading {
        speed_bps: Some(speed),
        ..
    } = event
    {
        if speed.is_finite() && *speed > *peak {
            *peak = *speed;
        }
    }
}
