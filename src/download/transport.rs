//! Artifact transport
//!
//! The coordinator only needs "put the bytes for this model at this path and
//! tell me how far along you are". `HttpTransport` does that over HTTPS with a
//! streaming body.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::catalog::ModelDescriptor;
use crate::error::{CoreError, DownloadFailure};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Storage(String),
    #[error("Download cancelled")]
    Cancelled,
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        let kind = match &e {
            TransportError::Network(_) => DownloadFailure::Network,
            TransportError::Storage(_) => DownloadFailure::Storage,
            TransportError::Cancelled => DownloadFailure::Cancelled,
        };
        CoreError::download(kind, e.to_string())
    }
}

/// Progress callback: (bytes written so far, expected total)
pub type ByteProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    /// Write the artifact for `model` to `dest`, truncating anything already
    /// there. Returns the number of bytes written.
    async fn fetch(
        &self,
        model: &'static ModelDescriptor,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError>;
}

/// Streaming HTTP(S) transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransport {
    async fn fetch(
        &self,
        model: &'static ModelDescriptor,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.client.get(model.source).send() => result
                .map_err(|e| TransportError::Network(format!("Failed to start download: {}", e)))?,
        };

        if !response.status().is_success() {
            return Err(TransportError::Network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let total_size = response.content_length().unwrap_or(model.download_size_bytes);

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to create file: {}", e)))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        on_progress(0, total_size);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| TransportError::Network(format!("Download error: {}", e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| TransportError::Storage(format!("Failed to write chunk: {}", e)))?;

            downloaded += chunk.len() as u64;
            on_progress(downloaded, total_size);
        }

        file.flush()
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to flush file: {}", e)))?;
        drop(file);

        // Basic sanity check: a truncated body is a network failure
        if downloaded < total_size / 2 {
            return Err(TransportError::Network(format!(
                "Downloaded file too small: {} bytes (expected ~{})",
                downloaded, total_size
            )));
        }

        Ok(downloaded)
    }
}
