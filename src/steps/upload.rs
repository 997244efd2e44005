//! Artifact upload step.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::logstream::LogStreamer;
use crate::runtime::Sandbox;
use crate::steps::{format_bytes, Step, StepError, StepResult};
use crate::uploader::Uploader;

const ERR_CREATE_TMP_DIR: &str = "Failed to create temp dir";
const ERR_ESTABLISH_STREAM: &str = "Failed to establish stream from container";
const ERR_READ_TAR: &str = "Failed to find first item in tar stream";
const ERR_CREATE_TMP_FILE: &str = "Failed to create temp file";
const ERR_COPY_STREAM_TO_TMP: &str = "Failed to copy stream contents into temp file";

/// Streams a sandbox path out as a tar archive, extracts the first entry
/// to a temporary file, and uploads it.
///
/// URL parse and uploader errors stay opaque: the URL may embed
/// credentials that must not reach the container's log stream.
pub struct UploadStep {
    sandbox: Arc<dyn Sandbox>,
    from_path: String,
    to_url: String,
    artifact_name: Option<String>,
    uploader: Arc<dyn Uploader>,
    semaphore: Arc<Semaphore>,
    temp_dir: PathBuf,
    streamer: LogStreamer,
    token: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl UploadStep {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        from_path: String,
        to_url: String,
        artifact_name: Option<String>,
        uploader: Arc<dyn Uploader>,
        semaphore: Arc<Semaphore>,
        temp_dir: PathBuf,
        streamer: LogStreamer,
        token: CancellationToken,
    ) -> Self {
        Self {
            sandbox,
            from_path,
            to_url,
            artifact_name,
            uploader,
            semaphore,
            temp_dir,
            streamer,
            token,
        }
    }
}

#[async_trait]
impl Step for UploadStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.expect("upload semaphore closed")
            }
            _ = self.token.cancelled() => return Err(StepError::Cancelled),
        };

        debug!(from = %self.from_path, "starting upload");

        let url = Url::parse(&self.to_url)?;

        let scratch = tempfile::Builder::new()
            .prefix("upload")
            .tempdir_in(&self.temp_dir)
            .map_err(|err| StepError::emittable(ERR_CREATE_TMP_DIR, Some(err.into())))?;

        let archive = self
            .sandbox
            .stream_out(&self.from_path)
            .await
            .map_err(|err| StepError::emittable(ERR_ESTABLISH_STREAM, Some(err.into())))?;

        let artifact_path = scratch.path().join("artifact");
        let extract_to = artifact_path.clone();
        let reader = SyncIoBridge::new(archive);

        tokio::task::spawn_blocking(move || extract_first_entry(reader, &extract_to))
            .await
            .map_err(|join| StepError::emittable(ERR_READ_TAR, Some(StepError::Io(std::io::Error::other(join.to_string())))))??;

        let uploaded = self
            .uploader
            .upload(&artifact_path, &url, &self.token)
            .await?;

        if self.artifact_name.is_some() {
            self.streamer
                .stdout(format!("Uploaded ({})\n", format_bytes(uploaded)));
        }

        info!(from = %self.from_path, bytes = uploaded, "upload successful");
        Ok(())
    }
}

/// Reads the first entry out of a tar stream into `destination`.
fn extract_first_entry<R: std::io::Read>(
    reader: R,
    destination: &std::path::Path,
) -> Result<(), StepError> {
    let mut archive = tar::Archive::new(reader);

    let mut entries = archive
        .entries()
        .map_err(|err| StepError::emittable(ERR_READ_TAR, Some(err.into())))?;

    let mut first = match entries.next() {
        Some(Ok(entry)) => entry,
        Some(Err(err)) => return Err(StepError::emittable(ERR_READ_TAR, Some(err.into()))),
        None => {
            return Err(StepError::emittable(
                ERR_READ_TAR,
                Some(StepError::Io(std::io::Error::other("empty tar stream"))),
            ))
        }
    };

    let mut out = std::fs::File::create(destination)
        .map_err(|err| StepError::emittable(ERR_CREATE_TMP_FILE, Some(err.into())))?;

    std::io::copy(&mut first, &mut out)
        .map_err(|err| StepError::emittable(ERR_COPY_STREAM_TO_TMP, Some(err.into())))?;

    Ok(())
}
