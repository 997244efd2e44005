//! Artifact uploader.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::error::UploadError;

/// Contract the upload step consumes.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads the file at `path` to `url` and returns the number of
    /// bytes sent. Cancelling `token` aborts the transfer.
    async fn upload(
        &self,
        path: &Path,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<u64, UploadError>;
}

/// Plain HTTP POST uploader.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(skip_cert_verify: bool) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_cert_verify)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        path: &Path,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<u64, UploadError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(
                tokio_util::io::ReaderStream::new(file),
            ))
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = token.cancelled() => return Err(UploadError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(UploadError::BadStatus {
                status: response.status().as_u16(),
            });
        }

        info!(bytes = size, "artifact uploaded");
        Ok(size)
    }
}
