//! Uploaded image decoding and on-disk storage.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// URL prefix under which stored images are served.
pub const IMAGES_ROUTE: &str = "/images";

/// Decode a base64 PNG/JPEG payload, optionally wrapped in a `data:` URL.
///
/// Embedded whitespace (line-wrapped base64) is tolerated.
pub fn decode_base64_image(payload: &str) -> Result<DynamicImage> {
    let payload = match payload.trim().strip_prefix("data:") {
        Some(data_url) => data_url
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| Error::Parse("Invalid image: malformed data URL".to_string()))?,
        None => payload,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(Error::Parse("Invalid image: empty payload".to_string()));
    }

    let bytes = STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .map_err(|e| Error::Parse(format!("Invalid image: {}", e)))?;

    image::load_from_memory(&bytes).map_err(|e| Error::Parse(format!("Invalid image: {}", e)))
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &DynamicImage) -> std::result::Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Whether `name` is a plain file name safe to look up under the images root.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// An image persisted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub filename: String,
    pub path: PathBuf,
}

impl StoredImage {
    pub fn url(&self) -> String {
        format!("{}/{}", IMAGES_ROUTE, self.filename)
    }
}

/// PNG files kept under a single server-local directory.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encode `image` as PNG and write it under a fresh unique name.
    pub async fn save_png(&self, image: &DynamicImage) -> Result<StoredImage> {
        let bytes = encode_png(image).map_err(|e| Error::Internal(e.to_string()))?;
        let filename = format!("{}.png", uuid::Uuid::new_v4());
        let path = self.root.join(&filename);

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(file = %path.display(), bytes = bytes.len(), "Stored uploaded image");

        Ok(StoredImage { filename, path })
    }

    /// Locate a stored image by file name.
    ///
    /// Returns `None` for unsafe names, missing files and anything that
    /// resolves outside the images root.
    pub async fn resolve(&self, filename: &str) -> Option<PathBuf> {
        if !is_safe_filename(filename) {
            tracing::warn!(filename, "Rejected image lookup with unsafe file name");
            return None;
        }

        let root = tokio::fs::canonicalize(&self.root).await.ok()?;
        let path = tokio::fs::canonicalize(root.join(filename)).await.ok()?;
        let metadata = tokio::fs::metadata(&path).await.ok()?;

        (path.starts_with(&root) && metadata.is_file()).then_some(path)
    }

    /// Delete stored PNGs last modified more than `max_age` ago.
    ///
    /// Returns the number of files removed. A missing root counts as empty.
    pub async fn purge_older_than(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| !ext.eq_ignore_ascii_case("png")) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(file = %path.display(), "Failed to purge image: {}", e),
            }
        }

        Ok(removed)
    }

    /// Purge expired images now and then every `interval`, in the background.
    pub fn spawn_retention(&self, retention: Duration, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.purge_older_than(retention).await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("Purged {} expired images", count),
                    Err(e) => tracing::warn!("Image purge failed: {}", e),
                }
            }
        })
    }
}
