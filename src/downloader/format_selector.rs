// FormatSelector - turns raw yt-dlp formats into the presentable catalog
//
// Handles:
// - Stream-class filtering (video vs audio-only)
// - Grouping by (height, fps) for video and average bitrate for audio
// - Best pick per group (largest known or approximate size, first seen wins)
// - Stable unique display labels with a label -> format id lookup

use std::collections::HashMap;

use super::errors::DownloadError;
use super::extractors::DirectMedia;
use super::models::{DownloadType, FormatEntry, RawFormat, SortKey, StreamClass, DIRECT_PREFIX};
use super::utils::{format_number, format_size};

/// Catalog of the last successful fetch plus its id lookup
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    entries: Vec<FormatEntry>,
    by_label: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl FormatCatalog {
    fn from_entries(entries: Vec<FormatEntry>) -> Self {
        let mut by_label = HashMap::new();
        let mut by_id = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_label.insert(entry.display_label.clone(), idx);
            by_id.entry(entry.format_id.clone()).or_insert(idx);
        }
        Self {
            entries,
            by_label,
            by_id,
        }
    }

    pub fn entries(&self) -> &[FormatEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn by_label(&self, label: &str) -> Option<&FormatEntry> {
        self.by_label.get(label).map(|&i| &self.entries[i])
    }

    pub fn by_format_id(&self, format_id: &str) -> Option<&FormatEntry> {
        self.by_id.get(format_id).map(|&i| &self.entries[i])
    }

    /// Resolve a caller selection given either as label or as format id
    pub fn resolve(&self, selection: &str) -> Option<&FormatEntry> {
        self.by_label(selection)
            .or_else(|| self.by_format_id(selection))
    }
}

/// Format selector with grouping and ranking
pub struct FormatSelector;

impl FormatSelector {
    /// Build the catalog for a download type from raw formats
    pub fn build_catalog(
        formats: &[RawFormat],
        download_type: DownloadType,
    ) -> Result<FormatCatalog, DownloadError> {
        if formats.is_empty() {
            return Err(DownloadError::NoFormats);
        }

        let class = download_type.stream_class();
        let entries = match class {
            StreamClass::Video => Self::video_entries(formats),
            StreamClass::Audio => Self::audio_entries(formats),
        };

        if entries.is_empty() {
            return Err(DownloadError::NoCompatibleFormats(class));
        }

        Ok(FormatCatalog::from_entries(dedupe_labels(entries)))
    }

    /// Catalog for media found by the alternate extraction path
    pub fn build_direct_catalog(
        media: &DirectMedia,
        download_type: DownloadType,
    ) -> Result<FormatCatalog, DownloadError> {
        let mut entries = Vec::new();

        match download_type.stream_class() {
            StreamClass::Video => {
                for url in &media.video_urls {
                    entries.push(direct_entry("Video", url, "mp4"));
                }
            }
            StreamClass::Audio => {
                // Audio extraction works on any container, so video sources qualify too
                for url in media.audio_urls.iter().chain(media.video_urls.iter()) {
                    entries.push(direct_entry("Audio", url, "mp3"));
                }
            }
        }

        if entries.is_empty() {
            return Err(DownloadError::NoCompatibleFormats(download_type.stream_class()));
        }

        Ok(FormatCatalog::from_entries(dedupe_labels(entries)))
    }

    /// One entry per (height, fps) group, sorted by height then fps, descending
    fn video_entries(formats: &[RawFormat]) -> Vec<FormatEntry> {
        let candidates = formats
            .iter()
            .filter(|f| f.has_video() && f.height.is_some());

        let groups = group_by(candidates, |f| {
            (f.height.unwrap_or(0), f.fps.map(milli))
        });

        let mut entries: Vec<FormatEntry> = groups
            .into_iter()
            .map(|group| {
                let best = pick_largest(&group);
                let height = best.height.unwrap_or(0);
                let fps_str = best
                    .fps
                    .filter(|fps| *fps > 0.0)
                    .map(|fps| format!(" ({}fps)", format_number(fps)))
                    .unwrap_or_default();

                FormatEntry {
                    display_label: format!(
                        "{}p{} - {}",
                        height,
                        fps_str,
                        format_size(best.effective_size())
                    ),
                    format_id: best.format_id.clone(),
                    extension: non_empty_or(&best.ext, "mp4"),
                    sort_key: SortKey {
                        rank: height as f64,
                        fps: best.fps.unwrap_or(0.0),
                    },
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.sort_key
                .partial_cmp(&a.sort_key)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }

    /// One entry per average bitrate, sorted by bitrate descending
    fn audio_entries(formats: &[RawFormat]) -> Vec<FormatEntry> {
        let candidates = formats
            .iter()
            .filter(|f| f.is_audio_only() && f.abr.map_or(false, |abr| abr > 0.0));

        let groups = group_by(candidates, |f| milli(f.abr.unwrap_or(0.0)));

        let mut entries: Vec<FormatEntry> = groups
            .into_iter()
            .map(|group| {
                let best = pick_largest(&group);
                let abr = best.abr.unwrap_or(0.0);

                FormatEntry {
                    display_label: format!(
                        "{} kbps - {}",
                        format_number(abr),
                        format_size(best.effective_size())
                    ),
                    format_id: best.format_id.clone(),
                    extension: non_empty_or(&best.ext, "m4a"),
                    sort_key: SortKey { rank: abr, fps: 0.0 },
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.sort_key
                .partial_cmp(&a.sort_key)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }
}

/// Groups keep first-seen order so ties resolve deterministically
fn group_by<'a, K, I, F>(items: I, key: F) -> Vec<Vec<&'a RawFormat>>
where
    K: Eq + std::hash::Hash,
    I: Iterator<Item = &'a RawFormat>,
    F: Fn(&RawFormat) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<&'a RawFormat>> = Vec::new();

    for item in items {
        let slot = *index.entry(key(item)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(item);
    }

    groups
}

/// Largest known or approximate size; the first candidate wins ties
fn pick_largest<'a>(group: &[&'a RawFormat]) -> &'a RawFormat {
    let mut best = group[0];
    for candidate in &group[1..] {
        if candidate.effective_size().unwrap_or(0) > best.effective_size().unwrap_or(0) {
            best = candidate;
        }
    }
    best
}

fn direct_entry(kind: &str, url: &str, ext: &str) -> FormatEntry {
    let short: String = url.chars().take(30).collect();
    FormatEntry {
        display_label: format!("{} (Direct) - {}...", kind, short),
        format_id: format!("{}{}", DIRECT_PREFIX, url),
        extension: ext.to_string(),
        sort_key: SortKey::default(),
    }
}

/// Labels are catalog keys; suffix any collision with its format id
fn dedupe_labels(entries: Vec<FormatEntry>) -> Vec<FormatEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, mut entry)| {
            if !seen.insert(entry.display_label.clone()) {
                let mut label = format!("{} [{}]", entry.display_label, entry.format_id);
                if seen.contains(&label) {
                    label = format!("{} #{}", label, idx + 1);
                }
                seen.insert(label.clone());
                entry.display_label = label;
            }
            entry
        })
        .collect()
}

fn milli(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
