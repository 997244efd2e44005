//! Cached artifact downloader.
//!
//! Downloads are keyed by a caller-supplied cache key and normalized to
//! tar before they are handed to the download step, so the step can
//! stream them straight into a sandbox. The cache is a flat directory
//! capped in size; when the cap is exceeded the oldest entries go first.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::DownloadError;
use crate::runtime::ByteReader;

/// A fetched artifact, already normalized to tar.
pub struct FetchedArtifact {
    pub stream: ByteReader,
    pub size_bytes: Option<u64>,
}

/// Contract the download step consumes.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    /// Fetches `url`, normalizes it to tar, validates `checksum` when
    /// given, and returns a readable stream. Cancelling `token` aborts
    /// the transfer with [`DownloadError::Cancelled`].
    async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: Option<&str>,
        token: &CancellationToken,
    ) -> Result<FetchedArtifact, DownloadError>;
}

/// HTTP downloader with an on-disk, size-capped cache.
pub struct HttpDownloader {
    client: reqwest::Client,
    cache_dir: PathBuf,
    max_cache_size_bytes: u64,
}

impl HttpDownloader {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_cache_size_bytes: u64,
        skip_cert_verify: bool,
        ca_cert_bundle_pem: Option<&[u8]>,
    ) -> Result<Self, DownloadError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(skip_cert_verify);
        if let Some(pem) = ca_cert_bundle_pem {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(Self {
            client: builder.build()?,
            cache_dir,
            max_cache_size_bytes,
        })
    }

    fn cache_path(&self, cache_key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(cache_key.as_bytes());
        self.cache_dir.join(format!("{:x}", hasher.finalize()))
    }

    async fn open_artifact(path: &Path) -> Result<FetchedArtifact, DownloadError> {
        let file = tokio::fs::File::open(path).await?;
        let size_bytes = file.metadata().await.ok().map(|m| m.len());
        Ok(FetchedArtifact {
            stream: Box::new(file),
            size_bytes,
        })
    }

    async fn transfer(
        &self,
        url: &Url,
        destination: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let request = self.client.get(url.clone()).send();

        let response = tokio::select! {
            response = request => response?,
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(DownloadError::BadStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut response = response;
        let mut file = tokio::fs::File::create(destination).await?;

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk?,
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
            };

            match chunk {
                Some(bytes) => file.write_all(&bytes).await?,
                None => break,
            }
        }

        file.flush().await?;
        Ok(())
    }

    /// Walks the cache and removes oldest entries until it fits the cap.
    fn evict(cache_dir: &Path, max_bytes: u64) -> std::io::Result<()> {
        let mut entries: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total = 0u64;

        for entry in std::fs::read_dir(cache_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                total += meta.len();
                entries.push((
                    entry.path(),
                    meta.len(),
                    meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                ));
            }
        }

        if total <= max_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in entries {
            debug!("evicting cached artifact {}", path.display());
            std::fs::remove_file(&path)?;
            total -= len;
            if total <= max_bytes {
                break;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ArtifactDownloader for HttpDownloader {
    async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: Option<&str>,
        token: &CancellationToken,
    ) -> Result<FetchedArtifact, DownloadError> {
        let cached = !cache_key.is_empty();
        let final_path = if cached {
            self.cache_path(cache_key)
        } else {
            self.cache_dir
                .join(format!("transient-{}", uuid::Uuid::new_v4()))
        };

        if cached && tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(%url, cache_key, "artifact cache hit");
            return Self::open_artifact(&final_path).await;
        }

        info!(%url, cache_key, "fetching artifact");

        let staging = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        let staging_path = staging.path().to_path_buf();

        self.transfer(url, &staging_path, token).await?;

        let expected = checksum.map(str::to_string);
        let normalize_source = staging_path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(expected) = expected {
                verify_checksum(&normalize_source, &expected)?;
            }
            normalize_to_tar(&normalize_source)
        })
        .await
        .map_err(|join| std::io::Error::other(join.to_string()))??;

        // Disarm the delete-on-drop guard only once the bytes are good.
        let staging_path = staging.into_temp_path().keep().map_err(|e| e.error)?;
        tokio::fs::rename(&staging_path, &final_path).await?;

        if cached {
            let cache_dir = self.cache_dir.clone();
            let max = self.max_cache_size_bytes;
            let evicted = tokio::task::spawn_blocking(move || Self::evict(&cache_dir, max))
                .await
                .map_err(|join| std::io::Error::other(join.to_string()))
                .and_then(|result| result);
            if let Err(err) = evicted {
                warn!("cache eviction failed: {err}");
            }
        }

        Self::open_artifact(&final_path).await
    }
}

/// Rewrites gzip-compressed artifacts as plain tar in place. Plain tar
/// passes through untouched.
fn normalize_to_tar(path: &Path) -> Result<(), DownloadError> {
    const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

    let mut magic = [0u8; 2];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(path)?;
        if file.read_exact(&mut magic).is_err() {
            return Ok(());
        }
    }

    if magic != GZIP_MAGIC {
        return Ok(());
    }

    let decompressed = path.with_extension("tar");
    {
        let source = std::fs::File::open(path)?;
        let mut decoder = GzDecoder::new(source);
        let mut out = std::fs::File::create(&decompressed)?;
        std::io::copy(&mut decoder, &mut out)?;
    }
    std::fs::rename(&decompressed, path)?;
    Ok(())
}

fn verify_checksum(path: &Path, expected: &str) -> Result<(), DownloadError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(DownloadError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
