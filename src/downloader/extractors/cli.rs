// CLI extractor - drives the native `yt-dlp` binary
//
// Probing uses `--dump-json`; downloads stream stdout/stderr line by line
// through `ProgressDecoder`. Cancellation sends SIGTERM first and only kills
// the process when it outlives the grace period.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::downloader::errors::DownloadError;
use crate::downloader::models::{DownloadJob, MediaInfo};
use crate::downloader::progress::{progress_template_args, ProgressDecoder, ToolEvent};
use crate::downloader::traits::MediaExtractor;
use crate::downloader::utils::{request_terminate, run_output_with_timeout};

/// Lines of stderr kept for error classification
const STDERR_TAIL_LINES: usize = 20;
/// yt-dlp exit status when `--max-downloads` stops it early
const MAX_DOWNLOADS_REACHED: i32 = 101;

/// yt-dlp binary extractor
pub struct YtDlpCli {
    program: PathBuf,
    probe_timeout_secs: u64,
    socket_timeout_secs: u32,
    terminate_grace: Duration,
}

impl YtDlpCli {
    pub fn new(
        program: PathBuf,
        probe_timeout_secs: u64,
        socket_timeout_secs: u32,
        terminate_grace: Duration,
    ) -> Self {
        Self {
            program,
            probe_timeout_secs,
            socket_timeout_secs,
            terminate_grace,
        }
    }

    fn program_str(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    fn build_probe_args(&self, url: &str) -> Vec<String> {
        vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.socket_timeout_secs.to_string(),
            url.to_string(),
        ]
    }

    /// Full argument list for one transfer
    pub fn build_download_args(job: &DownloadJob) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--socket-timeout".to_string(),
            job.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            job.retries.to_string(),
            "--concurrent-fragments".to_string(),
            job.concurrent_fragments.max(1).to_string(),
        ];
        args.extend(progress_template_args());

        if let Some(muxer) = &job.muxer_location {
            args.push("--ffmpeg-location".to_string());
            args.push(muxer.to_string_lossy().to_string());
        }

        args.push("--format".to_string());
        args.push(job.format_selector.clone());

        if let Some(container) = &job.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }

        if let Some(audio) = &job.extract_audio {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push(audio.codec.clone());
            args.push("--audio-quality".to_string());
            args.push(audio.quality.clone());
        }

        if let Some(max) = job.max_downloads {
            args.push("--max-downloads".to_string());
            args.push(max.to_string());
        }

        args.push("--output".to_string());
        args.push(job.output_template.clone());
        args.push(job.url.clone());
        args
    }

    fn parse_probe(stdout: &[u8]) -> Result<MediaInfo, DownloadError> {
        let text = String::from_utf8_lossy(stdout);
        let json_line = text
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with('{'))
            .ok_or_else(|| DownloadError::Parse("No JSON in yt-dlp output".to_string()))?;
        Ok(serde_json::from_str(json_line)?)
    }
}

/// Forward every line of `reader` into `tx`
fn spawn_line_reader<R>(reader: R, is_stderr: bool, tx: mpsc::UnboundedSender<(bool, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((is_stderr, line)).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl MediaExtractor for YtDlpCli {
    fn name(&self) -> &'static str {
        "yt-dlp-cli"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, DownloadError> {
        let args = self.build_probe_args(url);
        tracing::info!("[YtDlpCli] Probing {}", url);

        let output = run_output_with_timeout(&self.program_str(), args, self.probe_timeout_secs).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("[YtDlpCli] Probe failed: {}", stderr.trim());
            return Err(DownloadError::from_tool_failure(output.status.code(), &stderr));
        }

        let info = Self::parse_probe(&output.stdout)?;
        tracing::info!(
            "[YtDlpCli] Probe returned {} formats for {}",
            info.formats.len(),
            info.id
        );
        Ok(info)
    }

    async fn download(
        &self,
        job: DownloadJob,
        progress: UnboundedSender<ToolEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let args = Self::build_download_args(&job);
        tracing::info!("[YtDlpCli] {} {}", self.program.display(), args.join(" "));

        let mut child = TokioCommand::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DownloadError::ToolNotFound(self.program_str())
                } else {
                    DownloadError::Io(format!("Failed to start yt-dlp: {}", e))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Io("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Io("Failed to capture stderr".to_string()))?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        spawn_line_reader(stdout, false, line_tx.clone());
        spawn_line_reader(stderr, true, line_tx);

        let pump = tokio::spawn(async move {
            let mut decoder = ProgressDecoder::new();
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Some((is_stderr, line)) = line_rx.recv().await {
                if is_stderr {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                if let Some(event) = decoder.decode(&line) {
                    let _ = progress.send(event);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match finished {
            Some(status) => status?,
            None => {
                tracing::info!("[YtDlpCli] Cancel requested, terminating yt-dlp");
                request_terminate(&mut child);
                if timeout(self.terminate_grace, child.wait()).await.is_err() {
                    tracing::warn!(
                        "[YtDlpCli] Still running after {:?}, killing",
                        self.terminate_grace
                    );
                    let _ = child.kill().await;
                }
                pump.abort();
                return Err(DownloadError::Cancelled);
            }
        };

        let stderr_tail = pump.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        if job.max_downloads.is_some() && status.code() == Some(MAX_DOWNLOADS_REACHED) {
            tracing::debug!("[YtDlpCli] Stopped at --max-downloads limit");
            return Ok(());
        }

        tracing::error!(
            "[YtDlpCli] yt-dlp exited with {:?}: {}",
            status.code(),
            stderr_tail
        );
        Err(DownloadError::from_tool_failure(status.code(), &stderr_tail))
    }
}
