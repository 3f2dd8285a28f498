// Progress decoding and phase tracking
//
// yt-dlp is asked for structured progress lines through `--progress-template`.
// Those are authoritative; classic human-readable lines are only scraped while
// no structured line has been seen (older builds ignore the template).

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use super::events::CoreEvent;
use super::models::{Phase, ProgressSnapshot};
use super::utils::{bytes_per_sec_to_mbps, format_eta};

/// Prefix of download progress lines produced by our template
pub const PROGRESS_PREFIX: &str = "[progress]";
/// Prefix of post-processor progress lines produced by our template
pub const POSTPROCESS_PREFIX: &str = "[postprocess]";

/// Template arguments matching the prefixes above
pub fn progress_template_args() -> Vec<String> {
    vec![
        "--progress-template".to_string(),
        format!("download:{}%(progress)j", PROGRESS_PREFIX),
        "--progress-template".to_string(),
        format!("postprocess:{}%(progress)j", POSTPROCESS_PREFIX),
    ]
}

/// Normalized notification from the extractor
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed_bps: Option<f64>,
        eta: Option<String>,
    },
    /// Current stream finished transferring
    Finished { filename: Option<String> },
    /// A post-processor (merger, audio extraction, fixups) started
    PostProcessing { processor: String },
    /// Output path announced for the current stream
    Destination(String),
}

#[derive(Debug, Deserialize)]
struct RawProgress {
    #[serde(default)]
    status: String,
    downloaded_bytes: Option<f64>,
    total_bytes: Option<f64>,
    total_bytes_estimate: Option<f64>,
    speed: Option<f64>,
    eta: Option<f64>,
    filename: Option<String>,
    postprocessor: Option<String>,
}

lazy_static! {
    // [download]  12.5% of ~ 310.04MiB at  374.36KiB/s ETA 11:59 (frag 56/454)
    static ref PROGRESS_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*[KMGT]?i?B)\s+at\s+(\d+\.?\d*\s*[KMGT]?i?B)/s(?:\s+ETA\s+(\S+))?"
    ).unwrap();
    // [download]   12.34MiB at    1.00MiB/s (00:00:12)
    static ref UNKNOWN_SIZE_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*\s*[KMGT]?i?B)\s+at\s+(\d+\.?\d*\s*[KMGT]?i?B)/s"
    ).unwrap();
    static ref FINISHED_RE: Regex = Regex::new(r"\[download\]\s+100(?:\.0+)?%\s+of\s+.*\bin\s+\d").unwrap();
    static ref ALREADY_RE: Regex = Regex::new(r"\[download\]\s+(.+?) has already been downloaded").unwrap();
    static ref DEST_RE: Regex = Regex::new(r"\[download\]\s+Destination:\s+(.+)").unwrap();
    static ref MERGE_RE: Regex = Regex::new(r"\[Merger\]|Merging formats").unwrap();
    static ref EXTRACT_RE: Regex = Regex::new(r"\[ExtractAudio\]").unwrap();
    static ref SIZE_RE: Regex = Regex::new(r"^(\d+\.?\d*)\s*([KMGT]?)i?B$").unwrap();
}

/// Turns raw output lines into `ToolEvent`s
#[derive(Debug, Default)]
pub struct ProgressDecoder {
    structured_seen: bool,
}

impl ProgressDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a template line was decoded; scraping is disabled from then on
    pub fn is_structured(&self) -> bool {
        self.structured_seen
    }

    pub fn decode(&mut self, line: &str) -> Option<ToolEvent> {
        let line = line.trim();

        if let Some(json) = line.strip_prefix(PROGRESS_PREFIX) {
            self.structured_seen = true;
            return decode_download_json(json);
        }
        if let Some(json) = line.strip_prefix(POSTPROCESS_PREFIX) {
            self.structured_seen = true;
            return decode_postprocess_json(json);
        }

        // Post-processing markers are cheap to spot and always meaningful
        if MERGE_RE.is_match(line) {
            return Some(ToolEvent::PostProcessing {
                processor: "Merger".to_string(),
            });
        }
        if EXTRACT_RE.is_match(line) {
            return Some(ToolEvent::PostProcessing {
                processor: "ExtractAudio".to_string(),
            });
        }

        if let Some(caps) = DEST_RE.captures(line) {
            return Some(ToolEvent::Destination(caps[1].trim().to_string()));
        }

        if self.structured_seen {
            return None;
        }

        scrape_line(line)
    }
}

fn decode_download_json(json: &str) -> Option<ToolEvent> {
    let raw: RawProgress = match serde_json::from_str(json.trim()) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("[Progress] Unparseable progress line: {}", e);
            return None;
        }
    };

    match raw.status.as_str() {
        "downloading" => Some(ToolEvent::Downloading {
            downloaded_bytes: raw.downloaded_bytes.map(to_bytes).unwrap_or(0),
            total_bytes: raw
                .total_bytes
                .or(raw.total_bytes_estimate)
                .map(to_bytes)
                .filter(|t| *t > 0),
            speed_bps: raw.speed.filter(|s| s.is_finite() && *s >= 0.0),
            eta: raw
                .eta
                .filter(|e| e.is_finite() && *e >= 0.0)
                .map(|e| format_eta(e as u64)),
        }),
        "finished" => Some(ToolEvent::Finished {
            filename: raw.filename,
        }),
        _ => None,
    }
}

fn decode_postprocess_json(json: &str) -> Option<ToolEvent> {
    let raw: RawProgress = serde_json::from_str(json.trim()).ok()?;
    match raw.status.as_str() {
        "started" | "processing" => Some(ToolEvent::PostProcessing {
            processor: raw.postprocessor.unwrap_or_else(|| "unknown".to_string()),
        }),
        _ => None,
    }
}

fn scrape_line(line: &str) -> Option<ToolEvent> {
    if FINISHED_RE.is_match(line) {
        return Some(ToolEvent::Finished { filename: None });
    }

    if let Some(caps) = ALREADY_RE.captures(line) {
        return Some(ToolEvent::Finished {
            filename: Some(caps[1].trim().to_string()),
        });
    }

    if let Some(caps) = PROGRESS_RE.captures(line) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        let total = parse_size(caps.get(2)?.as_str());
        let downloaded = total
            .map(|t| (t as f64 * percent.clamp(0.0, 100.0) / 100.0).round() as u64)
            .unwrap_or(0);

        return Some(ToolEvent::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed_bps: caps.get(3).and_then(|m| parse_size(m.as_str())).map(|b| b as f64),
            eta: caps
                .get(4)
                .map(|m| m.as_str().to_string())
                .filter(|eta| eta != "Unknown"),
        });
    }

    if let Some(caps) = UNKNOWN_SIZE_RE.captures(line) {
        return Some(ToolEvent::Downloading {
            downloaded_bytes: parse_size(caps.get(1)?.as_str()).unwrap_or(0),
            total_bytes: None,
            speed_bps: caps.get(2).and_then(|m| parse_size(m.as_str())).map(|b| b as f64),
            eta: None,
        });
    }

    None
}

/// "310.04MiB" -> bytes (binary units)
fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    let factor = match &caps[2] {
        "" => 1.0,
        "K" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => 1024.0 * 1024.0 * 1024.0,
        _ => 1024.0 * 1024.0 * 1024.0 * 1024.0,
    };
    Some((value * factor).round() as u64)
}

fn to_bytes(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

/// Walks the phase sequence of one request and emits the matching events.
///
/// The cursor only moves forward: `Finished` advances to the next stream
/// phase or into merging after the last one, and any post-processing
/// notification jumps straight to merging.
#[derive(Debug)]
pub struct PhaseTracker {
    phases: Vec<Phase>,
    cursor: usize,
    merging: bool,
    last_percent: f64,
}

impl PhaseTracker {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self {
            phases,
            cursor: 0,
            merging: false,
            last_percent: 0.0,
        }
    }

    pub fn current_phase(&self) -> Phase {
        if self.merging {
            return Phase::Merging;
        }
        self.phases
            .get(self.cursor)
            .copied()
            .unwrap_or(Phase::Merging)
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    pub fn on_event(&mut self, event: &ToolEvent) -> Vec<CoreEvent> {
        match event {
            ToolEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                speed_bps,
                eta,
            } => {
                if self.merging {
                    return Vec::new();
                }
                let rate = speed_bps.map(bytes_per_sec_to_mbps);
                match total_bytes {
                    Some(total) if *total > 0 => {
                        let raw = (*downloaded_bytes as f64 / *total as f64 * 100.0).min(100.0);
                        let percent = raw.max(self.last_percent);
                        self.last_percent = percent;
                        vec![CoreEvent::Progress(ProgressSnapshot {
                            phase: self.current_phase(),
                            percent_complete: percent,
                            transfer_rate_mbps: rate,
                            eta: eta.clone(),
                        })]
                    }
                    _ => vec![CoreEvent::ProgressUnknown {
                        phase: self.current_phase(),
                        downloaded_bytes: *downloaded_bytes,
                        transfer_rate_mbps: rate,
                    }],
                }
            }
            ToolEvent::Finished { .. } => {
                if self.merging {
                    return Vec::new();
                }
                if self.cursor + 1 < self.phases.len() {
                    self.cursor += 1;
                    self.last_percent = 0.0;
                    let next = self.phases[self.cursor];
                    vec![CoreEvent::SetPhase(next), CoreEvent::StartPhase(next)]
                } else {
                    self.enter_merging()
                }
            }
            ToolEvent::PostProcessing { processor } => {
                if self.merging {
                    return Vec::new();
                }
                tracing::debug!("[Progress] Post-processing started: {}", processor);
                self.enter_merging()
            }
            ToolEvent::Destination(path) => {
                tracing::debug!("[Progress] Destination: {}", path);
                Vec::new()
            }
        }
    }

    fn enter_merging(&mut self) -> Vec<CoreEvent> {
        self.merging = true;
        self.last_percent = 0.0;
        vec![
            CoreEvent::SetPhase(Phase::Merging),
            CoreEvent::StartPhase(Phase::Merging),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloading(done: u64, total: Option<u64>) -> ToolEvent {
        ToolEvent::Downloading {
            downloaded_bytes: done,
            total_bytes: total,
            speed_bps: Some(1_048_576.0),
            eta: None,
        }
    }

    fn finished() -> ToolEvent {
        ToolEvent::Finished { filename: None }
    }

    fn percents(events: &[CoreEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Progress(p) => Some(p.percent_complete),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_audio_only_finishes_into_merging() {
        let mut tracker = PhaseTracker::new(vec![Phase::Audio]);
        let mut out = Vec::new();
        out.extend(tracker.on_event(&downloading(10, Some(100))));
        out.extend(tracker.on_event(&downloading(55, Some(100))));
        out.extend(tracker.on_event(&finished()));

        assert_eq!(percents(&out), vec![10.0, 55.0]);
        assert_eq!(out[2], CoreEvent::SetPhase(Phase::Merging));
        assert_eq!(out[3], CoreEvent::StartPhase(Phase::Merging));
        assert_eq!(tracker.current_phase(), Phase::Merging);
    }

    #[test]
    fn test_video_and_audio_advances_then_merges() {
        let mut tracker = PhaseTracker::new(vec![Phase::Video, Phase::Audio]);
        tracker.on_event(&downloading(90, Some(100)));

        let advanced = tracker.on_event(&finished());
        assert_eq!(
            advanced,
            vec![CoreEvent::SetPhase(Phase::Audio), CoreEvent::StartPhase(Phase::Audio)]
        );

        // Percent resets on the new phase
        let out = tracker.on_event(&downloading(5, Some(100)));
        assert_eq!(percents(&out), vec![5.0]);

        let merged = tracker.on_event(&finished());
        assert_eq!(merged.last(), Some(&CoreEvent::StartPhase(Phase::Merging)));
        // Extra finished events never push past the sequence
        assert!(tracker.on_event(&finished()).is_empty());
        assert_eq!(tracker.current_phase(), Phase::Merging);
    }

    #[test]
    fn test_postprocessing_forces_merging() {
        let mut tracker = PhaseTracker::new(vec![Phase::Video, Phase::Audio]);
        let out = tracker.on_event(&ToolEvent::PostProcessing {
            processor: "Merger".to_string(),
        });
        assert_eq!(out.last(), Some(&CoreEvent::StartPhase(Phase::Merging)));
        assert!(tracker.is_merging());
        assert!(tracker.on_event(&downloading(1, Some(2))).is_empty());
    }

    #[test]
    fn test_percent_is_clamped_and_monotonic() {
        let mut tracker = PhaseTracker::new(vec![Phase::Video]);
        let mut out = Vec::new();
        out.extend(tracker.on_event(&downloading(40, Some(100))));
        out.extend(tracker.on_event(&downloading(30, Some(100))));
        out.extend(tracker.on_event(&downloading(150, Some(100))));
        assert_eq!(percents(&out), vec![40.0, 40.0, 100.0]);
    }

    #[test]
    fn test_unknown_total_reports_bytes() {
        let mut tracker = PhaseTracker::new(vec![Phase::Video]);
        let out = tracker.on_event(&downloading(5_000_000, None));
        assert_eq!(
            out,
            vec![CoreEvent::ProgressUnknown {
                phase: Phase::Video,
                downloaded_bytes: 5_000_000,
                transfer_rate_mbps: Some(1.0),
            }]
        );
    }

    #[test]
    fn test_decodes_structured_download_line() {
        let mut decoder = ProgressDecoder::new();
        let line = r#"[progress]{"status": "downloading", "downloaded_bytes": 1024, "total_bytes": null, "total_bytes_estimate": 4096.0, "speed": 2097152.0, "eta": 75}"#;
        let event = decoder.decode(line).unwrap();
        assert_eq!(
            event,
            ToolEvent::Downloading {
                downloaded_bytes: 1024,
                total_bytes: Some(4096),
                speed_bps: Some(2_097_152.0),
                eta: Some("01:15".to_string()),
            }
        );
        assert!(decoder.is_structured());
    }

    #[test]
    fn test_decodes_structured_finished_and_postprocess() {
        let mut decoder = ProgressDecoder::new();
        let done = decoder
            .decode(r#"[progress]{"status": "finished", "filename": "/tmp/a.f137.mp4"}"#)
            .unwrap();
        assert_eq!(
            done,
            ToolEvent::Finished {
                filename: Some("/tmp/a.f137.mp4".to_string())
            }
        );

        let pp = decoder
            .decode(r#"[postprocess]{"status": "started", "postprocessor": "Merger"}"#)
            .unwrap();
        assert_eq!(
            pp,
            ToolEvent::PostProcessing {
                processor: "Merger".to_string()
            }
        );
        assert!(decoder
            .decode(r#"[postprocess]{"status": "finished", "postprocessor": "Merger"}"#)
            .is_none());
    }

    #[test]
    fn test_scrapes_classic_lines() {
        let mut decoder = ProgressDecoder::new();
        let event = decoder
            .decode("[download]  50.0% of ~ 10.00MiB at  1.00MiB/s ETA 00:05 (frag 3/10)")
            .unwrap();
        assert_eq!(
            event,
            ToolEvent::Downloading {
                downloaded_bytes: 5_242_880,
                total_bytes: Some(10_485_760),
                speed_bps: Some(1_048_576.0),
                eta: Some("00:05".to_string()),
            }
        );

        let unknown = decoder.decode("[download]    2.00MiB at  512.00KiB/s (00:00:04)").unwrap();
        assert_eq!(
            unknown,
            ToolEvent::Downloading {
                downloaded_bytes: 2_097_152,
                total_bytes: None,
                speed_bps: Some(524_288.0),
                eta: None,
            }
        );

        assert_eq!(
            decoder.decode("[download] 100% of   10.00MiB in 00:00:03 at 3.21MiB/s"),
            Some(ToolEvent::Finished { filename: None })
        );
        assert!(matches!(
            decoder.decode("[download] clip.mp4 has already been downloaded"),
            Some(ToolEvent::Finished { .. })
        ));
        assert!(matches!(
            decoder.decode("[Merger] Merging formats into \"clip.mp4\""),
            Some(ToolEvent::PostProcessing { .. })
        ));
        assert!(matches!(
            decoder.decode("[ExtractAudio] Destination: clip.mp3"),
            Some(ToolEvent::PostProcessing { .. })
        ));
        assert_eq!(
            decoder.decode("[download] Destination: clip.f137.mp4"),
            Some(ToolEvent::Destination("clip.f137.mp4".to_string()))
        );
        assert!(decoder.decode("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_scraping_disabled_after_structured_line() {
        let mut decoder = ProgressDecoder::new();
        decoder.decode(r#"[progress]{"status": "downloading", "downloaded_bytes": 1}"#);
        assert!(decoder
            .decode("[download]  50.0% of 10.00MiB at 1.00MiB/s ETA 00:05")
            .is_none());
        // Merge markers still count
        assert!(decoder.decode("[Merger] Merging formats into \"x.mp4\"").is_some());
    }
}
