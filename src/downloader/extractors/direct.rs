// Alternate extraction for sites the regular extractor handles poorly
//
// Fetches the page once and scrapes media URLs out of <video>/<source>
// elements and inline scripts. Results become synthetic `direct:` formats.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::downloader::errors::DownloadError;
use crate::downloader::traits::PageResolver;

/// Hosts routed through the alternate path by default
pub const DEFAULT_DIRECT_DOMAINS: &[&str] = &["vimeo.com", "dailymotion.com", "twitch.tv"];

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Media URLs found on a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectMedia {
    pub title: Option<String>,
    pub video_urls: Vec<String>,
    pub audio_urls: Vec<String>,
}

impl DirectMedia {
    pub fn is_empty(&self) -> bool {
        self.video_urls.is_empty() && self.audio_urls.is_empty()
    }
}

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
    static ref ELEMENT_SRC_RE: Regex =
        Regex::new(r#"(?is)<(?:video|source)\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref SCRIPT_RE: Regex = Regex::new(r"(?is)<script\b[^>]*>(.*?)</script>").unwrap();
    static ref MEDIA_URL_RE: Regex =
        Regex::new(r#"https?://[^"'\s<>\\]+?\.(mp4|webm|m3u8|mp3|m4a)\b(?:[?#][^"'\s<>\\]*)?"#).unwrap();
}

pub struct DirectMediaResolver {
    client: reqwest::Client,
    domains: Vec<String>,
}

impl DirectMediaResolver {
    pub fn new(timeout_secs: u64) -> Result<Self, DownloadError> {
        Self::with_domains(
            timeout_secs,
            DEFAULT_DIRECT_DOMAINS.iter().map(|d| d.to_string()).collect(),
        )
    }

    pub fn with_domains(timeout_secs: u64, domains: Vec<String>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DownloadError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, domains })
    }

    /// True when the URL's host is (a subdomain of) a listed domain
    pub fn is_required(&self, url: &str) -> bool {
        let host = match Url::parse(url.trim()).ok().and_then(|u| u.host_str().map(str::to_lowercase)) {
            Some(host) => host,
            None => return false,
        };
        self.domains.iter().any(|domain| {
            host == *domain || host.ends_with(&format!(".{}", domain))
        })
    }

    /// Download the page and scrape it
    pub async fn fetch_media(&self, url: &str) -> Result<DirectMedia, DownloadError> {
        let base = Url::parse(url.trim())
            .map_err(|e| DownloadError::UnsupportedUrl(format!("{}: {}", url, e)))?;

        tracing::info!("[Direct] Fetching {}", base);
        let response = self
            .client
            .get(base.clone())
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Network(format!("HTTP {} for {}", status, base)));
        }

        let html = response
            .text()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let media = parse_page(&html, Some(&base));
        tracing::info!(
            "[Direct] Found {} video and {} audio URLs",
            media.video_urls.len(),
            media.audio_urls.len()
        );
        Ok(media)
    }
}

#[async_trait]
impl PageResolver for DirectMediaResolver {
    fn handles(&self, url: &str) -> bool {
        self.is_required(url)
    }

    async fn resolve(&self, url: &str) -> Result<DirectMedia, DownloadError> {
        self.fetch_media(url).await
    }
}

/// Scrape title and media URLs from page markup
pub fn parse_page(html: &str, base: Option<&Url>) -> DirectMedia {
    let mut media = DirectMedia {
        title: TITLE_RE
            .captures(html)
            .map(|c| decode_entities(c[1].trim()))
            .filter(|t| !t.is_empty()),
        ..Default::default()
    };

    for caps in ELEMENT_SRC_RE.captures_iter(html) {
        if let Some(url) = absolutize(&decode_entities(&caps[1]), base) {
            push_unique(&mut media.video_urls, url);
        }
    }

    for script in SCRIPT_RE.captures_iter(html) {
        // JSON blobs escape slashes
        let body = script[1].replace("\\/", "/");
        for caps in MEDIA_URL_RE.captures_iter(&body) {
            let url = caps[0].to_string();
            match &caps[1] {
                "mp3" | "m4a" => push_unique(&mut media.audio_urls, url),
                _ => push_unique(&mut media.video_urls, url),
            }
        }
    }

    media
}

fn absolutize(src: &str, base: Option<&Url>) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("blob:") || src.starts_with("data:") {
        return None;
    }
    match Url::parse(src) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base.and_then(|b| b.join(src).ok()).map(|u| u.to_string()),
    }
}

fn push_unique(list: &mut Vec<String>, url: String) {
    if !list.contains(&url) {
        list.push(url);
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
