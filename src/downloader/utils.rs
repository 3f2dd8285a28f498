// Helper functions shared by the extractors and the orchestrator

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::timeout;

use super::errors::DownloadError;

const BYTES_PER_MIB: f64 = 1_048_576.0;
const MAX_FILENAME_CHARS: usize = 150;

/// Run command with timeout, capturing both pipes
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, DownloadError> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DownloadError::ToolNotFound(program.to_string())
            } else {
                DownloadError::Io(format!("Failed to start {}: {}", program, e))
            }
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| DownloadError::Io(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| DownloadError::Io(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
        Ok(status_res) => {
            let status = status_res?;
            let stdout = stdout_task
                .await
                .map_err(|e| DownloadError::Io(format!("stdout task failed: {}", e)))??;
            let stderr = stderr_task
                .await
                .map_err(|e| DownloadError::Io(format!("stderr task failed: {}", e)))??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(DownloadError::Network(format!(
                "{} timed out after {}s",
                program, timeout_secs
            )))
        }
    }
}

/// Ask a child to exit: SIGTERM on unix, hard kill elsewhere
pub fn request_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                return;
            }
        }
    }
    let _ = child.start_kill();
}

/// Replace characters that are invalid in file names on any major OS
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return "download".to_string();
    }

    if trimmed.chars().count() > MAX_FILENAME_CHARS {
        let head: String = trimmed.chars().take(MAX_FILENAME_CHARS - 3).collect();
        return format!("{}...", head);
    }

    trimmed.to_string()
}

/// Size in binary megabytes with two decimals, "Unknown" when absent or zero
pub fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) if b > 0 => format!("{:.2} MB", b as f64 / BYTES_PER_MIB),
        _ => "Unknown".to_string(),
    }
}

/// Integral values without a fraction, others with at most two decimals
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        return format!("{}", value as i64);
    }
    let s = format!("{:.2}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Bytes per second to MiB/s rounded to one decimal
pub fn bytes_per_sec_to_mbps(speed: f64) -> f64 {
    (speed / BYTES_PER_MIB * 10.0).round() / 10.0
}

/// mm:ss, or h:mm:ss past an hour
pub fn format_eta(seconds: u64) -> String {
    let (h, rem) = (seconds / 3600, seconds % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Quick reachability probe used before network-heavy operations
pub async fn check_network(host: &str, port: u16, timeout_secs: u64) -> bool {
    match timeout(
        Duration::from_secs(timeout_secs),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::warn!("[Network] {}:{} unreachable: {}", host, port, e);
            false
        }
        Err(_) => {
            tracing::warn!("[Network] {}:{} timed out after {}s", host, port, timeout_secs);
            false
        }
    }
}
