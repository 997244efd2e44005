//! Artifact download step.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::downloader::ArtifactDownloader;
use crate::logstream::LogStreamer;
use crate::runtime::Sandbox;
use crate::steps::{format_bytes, Step, StepError, StepResult};

/// Fetches an artifact through the cached downloader and streams the
/// resulting archive into the sandbox.
///
/// Concurrency is bounded by a rate-limiting semaphore shared across all
/// downloads; the acquire itself is cancellable, so a cancelled step
/// returns before ever contacting the downloader.
pub struct DownloadStep {
    sandbox: Arc<dyn Sandbox>,
    from_url: String,
    to_path: String,
    cache_key: String,
    checksum: Option<String>,
    artifact_name: Option<String>,
    downloader: Arc<dyn ArtifactDownloader>,
    rate_limiter: Arc<Semaphore>,
    streamer: LogStreamer,
    token: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl DownloadStep {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        from_url: String,
        to_path: String,
        cache_key: String,
        checksum: Option<String>,
        artifact_name: Option<String>,
        downloader: Arc<dyn ArtifactDownloader>,
        rate_limiter: Arc<Semaphore>,
        streamer: LogStreamer,
        token: CancellationToken,
    ) -> Self {
        Self {
            sandbox,
            from_url,
            to_path,
            cache_key,
            checksum,
            artifact_name,
            downloader,
            rate_limiter,
            streamer,
            token,
        }
    }

    fn emit(&self, message: String) {
        if self.artifact_name.is_some() {
            self.streamer.stdout(message);
        }
    }

    fn artifact(&self) -> &str {
        self.artifact_name.as_deref().unwrap_or_default()
    }

    async fn download(&self) -> Result<crate::downloader::FetchedArtifact, StepError> {
        let url = Url::parse(&self.from_url)?;

        let artifact = self
            .downloader
            .fetch(&url, &self.cache_key, self.checksum.as_deref(), &self.token)
            .await?;

        Ok(artifact)
    }
}

#[async_trait]
impl Step for DownloadStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        let _permit = tokio::select! {
            permit = self.rate_limiter.acquire() => {
                permit.expect("download rate limiter closed")
            }
            _ = self.token.cancelled() => return Err(StepError::Cancelled),
        };

        debug!(url = %self.from_url, to = %self.to_path, "starting download");
        self.emit(format!("Downloading {}...\n", self.artifact()));

        let artifact = match self.download().await {
            Ok(artifact) => artifact,
            Err(err) => {
                if self.token.is_cancelled() {
                    return Err(StepError::Cancelled);
                }
                self.emit(format!("Failed to download {}\n", self.artifact()));
                return Err(StepError::emittable("Downloading failed", Some(err)));
            }
        };

        let size = artifact
            .size_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "unknown".to_string());
        info!(url = %self.from_url, %size, "finished download");
        self.emit(format!("Downloaded {} ({size})\n", self.artifact()));

        match self.sandbox.stream_in(&self.to_path, artifact.stream).await {
            Ok(()) => Ok(()),
            Err(_) if self.token.is_cancelled() => Err(StepError::Cancelled),
            Err(err) => Err(StepError::emittable(
                "Copying into the container failed",
                Some(err.into()),
            )),
        }
    }
}
