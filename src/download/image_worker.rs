use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use tracing::debug;

use crate::annotations::AnnotationRecord;
use crate::net::{DownloadOutcome, Fetcher, Host};

/// Why a record failed to produce an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    RateLimited,
    Transient,
    /// The URL could not be resolved to a direct image link.
    Resolve(String),
    /// The HTTP fetch succeeded but the payload is not a decodable image.
    Decode(String),
    Io(String),
    Permanent(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NotFound => write!(f, "not found"),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::Transient => write!(f, "transient network failure"),
            FailureReason::Resolve(reason) => write!(f, "URL resolution failed: {reason}"),
            FailureReason::Decode(reason) => write!(f, "image decode failed: {reason}"),
            FailureReason::Io(reason) => write!(f, "IO failure: {reason}"),
            FailureReason::Permanent(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerResult {
    Success { image_path: PathBuf },
    Failure { reason: FailureReason },
}

/// Outcome report for one record.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub record_id: String,
    pub result: WorkerResult,
}

#[derive(Debug, Deserialize)]
struct AlbumResponse {
    data: AlbumData,
}

#[derive(Debug, Deserialize)]
struct AlbumData {
    #[serde(default)]
    images: Vec<AlbumImage>,
}

#[derive(Debug, Deserialize)]
struct AlbumImage {
    link: String,
}

/// Stateless per-record download worker: resolves the record's URL to a
/// direct image link, fetches it under the right host budget, decodes,
/// optionally resizes, and writes `<images_dir>/<subreddit>/<id>.jpg`.
/// Safe to run concurrently against disjoint records.
pub struct ImageWorker {
    fetcher: Arc<Fetcher>,
    images_dir: PathBuf,
    /// Target size for the shorter edge; `None` disables resizing.
    shorter_edge: Option<u32>,
    imgur_client_id: Option<String>,
    imgur_album_base: String,
    reddit_base: String,
}

impl ImageWorker {
    pub fn new(
        fetcher: Arc<Fetcher>,
        images_dir: PathBuf,
        resize: i32,
        imgur_client_id: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            images_dir,
            shorter_edge: u32::try_from(resize).ok().filter(|&edge| edge > 0),
            imgur_client_id,
            imgur_album_base: "https://api.imgur.com/3/album".to_string(),
            reddit_base: "https://www.reddit.com".to_string(),
        }
    }

    #[cfg(test)]
    fn with_api_bases(mut self, imgur_album_base: String, reddit_base: String) -> Self {
        self.imgur_album_base = imgur_album_base;
        self.reddit_base = reddit_base;
        self
    }

    /// Deterministic on-disk location for a record's image.
    pub fn image_path(&self, record: &AnnotationRecord) -> PathBuf {
        self.images_dir
            .join(&record.subreddit)
            .join(format!("{}.jpg", record.id))
    }

    pub async fn process(&self, record: &AnnotationRecord) -> WorkerReport {
        let report = |result| WorkerReport {
            record_id: record.id.clone(),
            result,
        };

        let resolved = match self.resolve_url(&record.url).await {
            Ok(url) => url,
            Err(reason) => {
                return report(WorkerResult::Failure {
                    reason: FailureReason::Resolve(reason),
                });
            }
        };

        let host = Host::of_url(&resolved);
        let outcome = self.fetcher.fetch(&resolved, host).await;
        let bytes = match outcome {
            DownloadOutcome::Success { bytes, .. } => bytes,
            DownloadOutcome::NotFound => {
                return report(WorkerResult::Failure {
                    reason: FailureReason::NotFound,
                });
            }
            DownloadOutcome::RateLimited { .. } => {
                return report(WorkerResult::Failure {
                    reason: FailureReason::RateLimited,
                });
            }
            DownloadOutcome::Transient => {
                return report(WorkerResult::Failure {
                    reason: FailureReason::Transient,
                });
            }
            DownloadOutcome::Permanent { reason } => {
                return report(WorkerResult::Failure {
                    reason: FailureReason::Permanent(reason),
                });
            }
        };

        let path = self.image_path(record);
        match self.write_image(&bytes, &path) {
            Ok(()) => {
                debug!(id = %record.id, path = %path.display(), "image written");
                report(WorkerResult::Success { image_path: path })
            }
            Err(reason) => report(WorkerResult::Failure { reason }),
        }
    }

    /// Resolve an annotation URL to a direct image URL. Direct links pass
    /// through; Imgur posts are rewritten textually; Imgur albums and Reddit
    /// galleries need a secondary metadata fetch.
    async fn resolve_url(&self, url: &str) -> Result<String, String> {
        if is_direct_image_url(url) {
            return Ok(url.to_string());
        }
        if url.contains("imgur") {
            return self.resolve_imgur(url).await;
        }
        if url.contains("reddit.com") && url.contains("gallery") {
            return self.resolve_reddit_gallery(url).await;
        }
        // Unknown host: let the fetch decide.
        Ok(url.to_string())
    }

    async fn resolve_imgur(&self, url: &str) -> Result<String, String> {
        // Mobile URLs behave like regular post URLs.
        let url = url.replace("m.imgur.com", "imgur.com");

        if !url.contains("/a/") && !url.contains("gallery") {
            // Post URL: imgur.com/aBcDeF -> i.imgur.com/aBcDeF.jpg
            let direct = url.replace("imgur", "i.imgur");
            return Ok(format!("{}.jpg", direct.trim_end_matches(".jpg")));
        }

        // Albums and galleries: the post title refers to the displayed
        // (first) image, so ask the API for its direct link.
        let album_id = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let client_id = self
            .imgur_client_id
            .as_deref()
            .ok_or_else(|| "album link requires an imgur client id".to_string())?;

        let api_url = format!("{}/{}", self.imgur_album_base, album_id);
        let authorization = format!("Client-ID {client_id}");
        match self
            .fetcher
            .fetch_with_auth(&api_url, Host::Imgur, Some(&authorization))
            .await
        {
            DownloadOutcome::Success { bytes, .. } => {
                let album: AlbumResponse = serde_json::from_slice(&bytes)
                    .map_err(|e| format!("malformed album metadata: {e}"))?;
                album
                    .data
                    .images
                    .into_iter()
                    .next()
                    .map(|image| image.link)
                    .ok_or_else(|| "album contains no images".to_string())
            }
            other => Err(format!("album lookup failed: {}", other.label())),
        }
    }

    async fn resolve_reddit_gallery(&self, url: &str) -> Result<String, String> {
        let post_id = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let api_url = format!("{}/comments/{}.json", self.reddit_base, post_id);

        match self.fetcher.fetch(&api_url, Host::Reddit).await {
            DownloadOutcome::Success { bytes, .. } => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| format!("malformed gallery metadata: {e}"))?;
                let media_id = value
                    .pointer("/0/data/children/0/data/gallery_data/items/0/media_id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "gallery metadata has no items".to_string())?;
                Ok(format!("https://i.redd.it/{media_id}.jpg"))
            }
            other => Err(format!("gallery lookup failed: {}", other.label())),
        }
    }

    /// Decode, resize, and write the image as RGB JPEG. The write goes
    /// through a sibling temp file so a crash never leaves a partial image
    /// behind a populated `image_path`.
    fn write_image(&self, bytes: &[u8], path: &Path) -> Result<(), FailureReason> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| FailureReason::Decode(e.to_string()))?;

        let output = match self.shorter_edge {
            Some(target) => resize_shorter_edge(decoded, target),
            None => decoded,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FailureReason::Io(e.to_string()))?;
        }

        let tmp_path = path.with_extension("jpg.tmp");
        DynamicImage::ImageRgb8(output.to_rgb8())
            .save_with_format(&tmp_path, ImageFormat::Jpeg)
            .map_err(|e| FailureReason::Io(e.to_string()))?;
        fs::rename(&tmp_path, path).map_err(|e| FailureReason::Io(e.to_string()))?;
        Ok(())
    }
}

fn is_direct_image_url(url: &str) -> bool {
    if url.contains("i.redd.it")
        || url.contains("i.imgur.com")
        || url.contains("staticflickr.com")
        || url.contains("static.flickr.com")
    {
        return true;
    }
    let lower = url.to_lowercase();
    [".jpg", ".jpeg", ".png", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Scale so the shorter edge equals `target`, preserving aspect ratio
/// within rounding.
fn resize_shorter_edge(image: DynamicImage, target: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let shorter = width.min(height);
    if shorter == 0 || shorter == target {
        return image;
    }

    let scale = f64::from(target) / f64::from(shorter);
    let new_width = (f64::from(width) * scale).round().max(1.0) as u32;
    let new_height = (f64::from(height) * scale).round().max(1.0) as u32;
    image.resize_exact(new_width, new_height, FilterType::Triangle)
}
