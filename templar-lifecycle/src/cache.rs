//! Local cloud image cache.
//!
//! One file per image under the cache root, named by the registry's
//! `image_filename`. A file at that name is complete by construction:
//! downloads go to `<name>.part` and are renamed only after the checksum
//! (when one is declared) has been verified.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LifecycleError, Result};
use crate::registry::TemplateSpec;

/// Default cache directory.
pub const DEFAULT_CACHE_ROOT: &str = "/var/lib/vz/template/cache/templar";

/// A complete image in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub source_url: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// Makes a template's source image available locally.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Return a complete local copy of the template's image.
    async fn ensure(&self, spec: &TemplateSpec) -> Result<CacheEntry>;
}

/// Cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory holding cached images
    pub root: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CACHE_ROOT),
        }
    }
}

/// Image cache that downloads missing images over HTTP(S).
pub struct ImageCache {
    root: PathBuf,
    client: reqwest::Client,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Where a template's image lives in the cache.
    pub fn path_for(&self, spec: &TemplateSpec) -> PathBuf {
        self.root.join(&spec.image_filename)
    }

    async fn download(&self, spec: &TemplateSpec, dest: &Path) -> Result<()> {
        let fail = |cause: String| LifecycleError::DownloadFailed {
            url: spec.url.clone(),
            cause,
        };

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| fail(format!("cannot create cache directory: {}", e)))?;

        let response = self
            .client
            .get(&spec.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;

        let mut partial = dest.as_os_str().to_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut file = File::create(&partial)
            .await
            .map_err(|e| fail(format!("cannot create {}: {}", partial.display(), e)))?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(format!("error reading response: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("write failed: {}", e)))?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| fail(format!("write failed: {}", e)))?;
        drop(file);
        debug!(bytes = downloaded, "Download finished");

        if let Some(expected) = &spec.sha256 {
            let actual = sha256_file(&partial)
                .await
                .map_err(|e| fail(format!("cannot hash download: {}", e)))?;
            if !actual.eq_ignore_ascii_case(expected) {
                error!(expected = %expected, actual = %actual, "Checksum mismatch");
                if let Err(e) = fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %e, "Failed to remove rejected download");
                }
                return Err(fail(format!("checksum mismatch: expected {}, got {}", expected, actual)));
            }
            info!("Checksum verified");
        }

        fs::rename(&partial, dest)
            .await
            .map_err(|e| fail(format!("cannot move download into place: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ImageProvider for ImageCache {
    #[instrument(skip(self, spec), fields(template = %spec.name, image = %spec.image_filename))]
    async fn ensure(&self, spec: &TemplateSpec) -> Result<CacheEntry> {
        let path = self.path_for(spec);

        if !is_file(&path).await {
            info!(url = %spec.url, "Image not cached, downloading");
            self.download(spec, &path).await?;
        } else {
            debug!(path = %path.display(), "Image cache hit");
        }

        let size_bytes = fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| LifecycleError::DownloadFailed {
                url: spec.url.clone(),
                cause: format!("cached image unreadable: {}", e),
            })?;

        Ok(CacheEntry {
            source_url: spec.url.clone(),
            local_path: path,
            size_bytes,
        })
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

/// Hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
