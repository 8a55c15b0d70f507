//! Media URLs: classification, download to scoped temporary files, sniffing.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use reqwest::Url;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::judge::Attachment;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];
const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".wav", ".ogg", ".flac", ".m4a"];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".wmv", ".flv", ".webm"];

/// Broad class of a media URL, decided by its file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Unknown,
}

impl MediaKind {
    pub fn of_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let ends_with_any = |exts: &[&str]| exts.iter().any(|e| lower.ends_with(e));
        if ends_with_any(IMAGE_EXTENSIONS) {
            MediaKind::Image
        } else if ends_with_any(AUDIO_EXTENSIONS) {
            MediaKind::Audio
        } else if ends_with_any(VIDEO_EXTENSIONS) {
            MediaKind::Video
        } else {
            MediaKind::Unknown
        }
    }
}

pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Lowercased suffix of the last path segment, with the leading dot, or an
/// empty string for unparsable URLs.
pub fn url_extension(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };
    let file = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    match file.rfind('.') {
        Some(idx) if idx > 0 => file[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

pub fn extensions_match(url1: &str, url2: &str) -> bool {
    url_extension(url1) == url_extension(url2)
}

/// A downloaded file. The temporary file is removed when this is dropped.
#[derive(Debug)]
pub struct DownloadedFile {
    url: String,
    file: NamedTempFile,
}

impl DownloadedFile {
    /// Write `bytes` into a fresh temporary file carrying the URL's suffix.
    pub fn from_bytes(url: &str, bytes: &[u8]) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("safepush-")
            .suffix(&url_extension(url))
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self {
            url: url.to_string(),
            file,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path())?)
    }

    /// Sniffed media type of the downloaded content.
    pub fn media_type(&self) -> Result<String> {
        let bytes = self.read_bytes()?;
        Ok(sniff_media_type(&bytes, &self.url).to_string())
    }

    pub fn attachment(&self) -> Result<Attachment> {
        Ok(Attachment {
            path: self.path().to_path_buf(),
            media_type: self.media_type()?,
        })
    }
}

/// Fetches media URLs into scoped local files.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn download(&self, url: &str) -> Result<DownloadedFile>;
}

/// Download several URLs. Files already fetched are released if a later one fails.
pub async fn download_many(fetcher: &dyn MediaFetcher, urls: &[String]) -> Result<Vec<DownloadedFile>> {
    let mut files = Vec::with_capacity(urls.len());
    for url in urls {
        files.push(fetcher.download(url).await?);
    }
    Ok(files)
}

/// [`MediaFetcher`] over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("safepush/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HarnessError::Media(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn download(&self, url: &str) -> Result<DownloadedFile> {
        debug!(url, "downloading media");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HarnessError::Media(format!("failed to download {url}: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HarnessError::Media(format!("failed to read body of {url}: {e}")))?;
        DownloadedFile::from_bytes(url, &bytes)
    }
}

/// Media type from magic bytes, falling back to the URL suffix.
pub fn sniff_media_type(bytes: &[u8], url: &str) -> &'static str {
    let starts = |magic: &[u8]| bytes.starts_with(magic);
    if starts(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if starts(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if starts(b"GIF87a") || starts(b"GIF89a") {
        return "image/gif";
    }
    if starts(b"BM") {
        return "image/bmp";
    }
    if bytes.len() >= 12 && starts(b"RIFF") {
        match &bytes[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wav",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }
    if starts(b"OggS") {
        return "audio/ogg";
    }
    if starts(b"fLaC") {
        return "audio/flac";
    }
    if starts(b"ID3") || starts(b"\xff\xfb") || starts(b"\xff\xf3") {
        return "audio/mpeg";
    }
    if starts(b"\x1a\x45\xdf\xa3") {
        return "video/webm";
    }
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return "video/mp4";
    }
    match url_extension(url).as_str() {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".mp3" => "audio/mpeg",
        ".wav" => "audio/wav",
        ".ogg" => "audio/ogg",
        ".mp4" => "video/mp4",
        ".txt" => "text/plain",
        ".json" => "application/json",
        _ => "application/octet-stream",
    }
}
