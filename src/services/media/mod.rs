//! Media retrieval: resolve a task's `file_url` into a validated local file.
//!
//! The download runs in two phases: a ranged probe of the first kilobyte to
//! learn the content type and, when the server honors range requests, the
//! total size (letting the size cap reject oversized media before the
//! transfer), then a streaming download into the temp root with the cap
//! enforced on the fly. The stored file is owner-only and its realpath must
//! stay inside the temp root.

use futures::StreamExt;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE, CONTENT_TYPE, ORIGIN, RANGE, REFERER};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::MediaConfig;
use crate::error::WhisperdError;
use crate::services::files::{is_allowed_extension, TempFiles};
use crate::Result;

pub mod probe;

/// Fixed wait between HTTP retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// A downloaded, validated media file.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: i64,
    pub duration_seconds: f64,
}

/// Downloads remote media into the temp root.
pub struct MediaFetcher {
    client: Client,
    config: MediaConfig,
    temp: Arc<TempFiles>,
}

impl MediaFetcher {
    pub fn new(config: MediaConfig, temp: Arc<TempFiles>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("whisperd/{}", crate::VERSION))
            .build()
            .map_err(|e| {
                WhisperdError::media_fetch(format!("failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            config,
            temp,
        })
    }

    /// Request headers for the platform owning this URL, if any.
    fn platform_headers(&self, url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for entry in &self.config.platform_headers {
            if !url.contains(&entry.url_contains) {
                continue;
            }
            if let Some(referer) = &entry.referer {
                if let Ok(value) = HeaderValue::from_str(referer) {
                    headers.insert(REFERER, value);
                }
            }
            if let Some(origin) = &entry.origin {
                if let Ok(value) = HeaderValue::from_str(origin) {
                    headers.insert(ORIGIN, value);
                }
            }
            break;
        }
        headers
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let attempts = self.config.request_retry_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("media request attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(WhisperdError::media_fetch(format!(
            "request failed after {} attempts: {}",
            attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    /// Download `url` into the temp root and probe its attributes.
    pub async fn download(&self, url: &str) -> Result<FetchedMedia> {
        let parsed = Url::parse(url)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(WhisperdError::invalid_submission(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        let headers = self.platform_headers(url);

        // Phase 1: ranged probe for content type and, if disclosed, size.
        let probe_range = format!("bytes=0-{}", self.config.probe_bytes.saturating_sub(1));
        let response = self
            .send_with_retry(|| {
                self.client
                    .get(url)
                    .headers(headers.clone())
                    .header(RANGE, probe_range.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(WhisperdError::media_fetch(format!(
                "probe request returned {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(total) = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
        {
            if total > self.config.max_file_size_bytes {
                return Err(WhisperdError::media_fetch(format!(
                    "file size exceeds the limit: {} > {}",
                    total, self.config.max_file_size_bytes
                )));
            }
        }
        drop(response);

        let extension = resolve_extension(content_type.as_deref(), &parsed).ok_or_else(|| {
            WhisperdError::UnsupportedFileType(
                content_type.unwrap_or_else(|| "unknown content type".to_string()),
            )
        })?;

        // Phase 2: streaming download with the cap enforced on the fly.
        let path = self.temp.allocate(&format!("media{}", extension))?;
        let response = self
            .send_with_retry(|| self.client.get(url).headers(headers.clone()))
            .await?;
        if !response.status().is_success() {
            return Err(WhisperdError::media_fetch(format!(
                "download request returned {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    self.temp.delete(&path).await;
                    return Err(WhisperdError::media_fetch(format!(
                        "download interrupted: {}",
                        e
                    )));
                }
            };
            written += chunk.len() as u64;
            if written > self.config.max_file_size_bytes {
                drop(file);
                self.temp.delete(&path).await;
                return Err(WhisperdError::media_fetch(format!(
                    "file size exceeds the limit: {} > {}",
                    written, self.config.max_file_size_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        self.temp.restrict_permissions(&path).await?;
        let real = self.temp.ensure_within_root(&path)?;

        let file_name = remote_file_name(&parsed).unwrap_or_else(|| {
            real.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        if !is_allowed_extension(&real.to_string_lossy()) {
            self.temp.delete(&real).await;
            return Err(WhisperdError::UnsupportedFileType(extension));
        }

        let duration_seconds = match probe::probe_duration_async(&real).await {
            Ok(duration) => duration,
            Err(e) => {
                self.temp.delete(&real).await;
                return Err(e);
            }
        };

        debug!(
            "downloaded {} -> {} ({} bytes, {:.2}s)",
            url,
            real.display(),
            written,
            duration_seconds
        );
        Ok(FetchedMedia {
            path: real,
            file_name,
            size_bytes: written as i64,
            duration_seconds,
        })
    }
}

/// Total size from a `Content-Range: bytes 0-1023/4567` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?;
    total.trim().parse().ok()
}

/// Map a content type (or the URL path) to a media extension.
fn resolve_extension(content_type: Option<&str>, url: &Url) -> Option<String> {
    if let Some(content_type) = content_type {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        let mapped = match essence {
            "audio/mpeg" | "audio/mp3" => Some(".mp3"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some(".wav"),
            "audio/mp4" | "audio/x-m4a" => Some(".m4a"),
            "audio/aac" => Some(".aac"),
            "audio/flac" | "audio/x-flac" => Some(".flac"),
            "audio/ogg" => Some(".ogg"),
            "audio/opus" => Some(".opus"),
            "audio/webm" => Some(".webm"),
            "video/mp4" => Some(".mp4"),
            "video/x-matroska" => Some(".mkv"),
            "video/webm" => Some(".webm"),
            "video/quicktime" => Some(".mov"),
            "video/x-msvideo" => Some(".avi"),
            "video/x-ms-wmv" => Some(".wmv"),
            "video/mpeg" => Some(".mpg"),
            _ => None,
        };
        if let Some(ext) = mapped {
            return Some(ext.to_string());
        }
    }

    // Fall back to the URL path extension when the server's content type
    // is generic (application/octet-stream and friends).
    let path = url.path();
    let name = path.rsplit('/').next().unwrap_or("");
    name.rfind('.').and_then(|index| {
        let ext = name[index..].to_ascii_lowercase();
        is_allowed_extension(&ext).then_some(ext)
    })
}

/// Display name taken from the final URL path segment.
fn remote_file_name(url: &Url) -> Option<String> {
    let name = url.path().rsplit('/').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformHeaders;
    use tempfile::TempDir;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-1023/4567"), Some(4567));
        assert_eq!(parse_content_range_total("bytes 0-1023/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_resolve_extension_from_content_type() {
        let url = Url::parse("https://host/stream").unwrap();
        assert_eq!(
            resolve_extension(Some("audio/mpeg"), &url),
            Some(".mp3".to_string())
        );
        assert_eq!(
            resolve_extension(Some("video/mp4; charset=binary"), &url),
            Some(".mp4".to_string())
        );
    }

    #[test]
    fn test_resolve_extension_falls_back_to_url_path() {
        let url = Url::parse("https://host/media/clip.mkv?sig=abc").unwrap();
        assert_eq!(
            resolve_extension(Some("application/octet-stream"), &url),
            Some(".mkv".to_string())
        );
        let bad = Url::parse("https://host/media/tool.exe").unwrap();
        assert_eq!(resolve_extension(None, &bad), None);
    }

    #[test]
    fn test_remote_file_name() {
        let url = Url::parse("https://host/a/b/song.mp3").unwrap();
        assert_eq!(remote_file_name(&url), Some("song.mp3".to_string()));
        let bare = Url::parse("https://host/").unwrap();
        assert_eq!(remote_file_name(&bare), None);
    }

    #[test]
    fn test_platform_headers_matching() {
        let dir = TempDir::new().unwrap();
        let config = MediaConfig {
            temp_dir: dir.path().to_path_buf(),
            platform_headers: vec![PlatformHeaders {
                url_contains: "douyin".to_string(),
                referer: Some("https://www.douyin.com/".to_string()),
                origin: Some("https://www.douyin.com".to_string()),
            }],
            ..MediaConfig::default()
        };
        let temp = Arc::new(TempFiles::new(&config).unwrap());
        let fetcher = MediaFetcher::new(config, temp).unwrap();

        let headers = fetcher.platform_headers("https://v.douyin.com/abc");
        assert_eq!(
            headers.get(REFERER).and_then(|v| v.to_str().ok()),
            Some("https://www.douyin.com/")
        );

        let none = fetcher.platform_headers("https://example.com/a.mp3");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_download_rejects_bad_scheme() {
        let dir = TempDir::new().unwrap();
        let config = MediaConfig {
            temp_dir: dir.path().to_path_buf(),
            ..MediaConfig::default()
        };
        let temp = Arc::new(TempFiles::new(&config).unwrap());
        let fetcher = MediaFetcher::new(config, temp).unwrap();
        let err = fetcher.download("ftp://host/file.mp3").await.unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }
}
