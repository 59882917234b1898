use std::path::Path;

use async_trait::async_trait;
use cloudstore_core::{DavError, Listing, WebDavClient};
use futures_util::future::BoxFuture;
use tempfile::TempPath;
use url::Url;

use super::progress::Progress;

/// One-level collection listings.
#[async_trait]
pub trait ListingTransport: Send + Sync {
    async fn list_one_level(&self, url: &Url) -> Result<Listing, DavError>;
}

#[async_trait]
impl ListingTransport for WebDavClient {
    async fn list_one_level(&self, url: &Url) -> Result<Listing, DavError> {
        WebDavClient::list_one_level(self, url).await
    }
}

/// Downloaded bytes waiting in the staging directory. The file is removed
/// when this value is dropped without being placed.
#[derive(Debug)]
pub struct DownloadedFile {
    pub version: String,
    pub temp: TempPath,
}

/// A transfer the transport already owned before the synchronizer asked,
/// e.g. one that survived a restart.
pub struct ResumedDownload {
    pub url: Url,
    pub progress: Progress,
    pub outcome: BoxFuture<'static, Result<DownloadedFile, DavError>>,
}

/// Body transfers into the staging directory.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Streams `url` into a temp file under `staging`, updating `progress`.
    /// Fails with [`DavError::Cancelled`] once `progress` is cancelled.
    async fn download(
        &self,
        url: &Url,
        staging: &Path,
        progress: &Progress,
    ) -> Result<DownloadedFile, DavError>;

    async fn resume_in_flight(&self, _staging: &Path) -> Vec<ResumedDownload> {
        Vec::new()
    }
}
