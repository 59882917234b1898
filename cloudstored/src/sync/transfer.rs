use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use cloudstore_core::{Authenticator, DavError};
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::ETAG;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use super::progress::Progress;
use super::transport::{DownloadTransport, DownloadedFile};

/// HTTP body transfers with a bound on concurrent downloads.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    auth: Authenticator,
    download_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(download_concurrency: usize) -> Self {
        Self::with_authenticator(Authenticator::default(), download_concurrency)
    }

    pub fn with_authenticator(auth: Authenticator, download_concurrency: usize) -> Self {
        Self {
            http: Client::new(),
            auth,
            download_limit: Arc::new(Semaphore::new(download_concurrency.max(1))),
        }
    }

    pub async fn download_to_staging(
        &self,
        url: &Url,
        staging: &Path,
        progress: &Progress,
    ) -> Result<DownloadedFile, DavError> {
        let _permit = tokio::select! {
            biased;
            _ = progress.cancelled() => return Err(DavError::Cancelled),
            permit = self.download_limit.clone().acquire_owned() => permit
                .map_err(|_| DavError::InvalidRequest("download limiter is closed".into()))?,
        };

        let response = tokio::select! {
            biased;
            _ = progress.cancelled() => return Err(DavError::Cancelled),
            response = self.auth.send(url, || self.http.get(url.clone())) => response?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DavError::Api { status, body });
        }
        let version = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DavError::InvalidResponse("download response has no ETag".into()))?;
        progress.set_total(response.content_length());

        tokio::fs::create_dir_all(staging).await?;
        let (file, temp) = tempfile::Builder::new()
            .prefix("download-")
            .suffix(".partial")
            .tempfile_in(staging)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = progress.cancelled() => return Err(DavError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            progress.advance(chunk.len() as u64);
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!(url = %url, bytes = progress.completed(), version = %version, "download staged");
        Ok(DownloadedFile { version, temp })
    }
}

#[async_trait]
impl DownloadTransport for TransferClient {
    async fn download(
        &self,
        url: &Url,
        staging: &Path,
        progress: &Progress,
    ) -> Result<DownloadedFile, DavError> {
        self.download_to_staging(url, staging, progress).await
    }
}
