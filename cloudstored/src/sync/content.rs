use std::collections::HashMap;
use std::sync::Arc;

use cloudstore_core::{AccountId, DavError, ResourceId, path_relative_to, url_for};
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::SyncError;
use super::events::{EventSink, SyncEvent};
use super::progress::Progress;
use super::transport::{DownloadTransport, DownloadedFile};
use crate::store::{Account, ResourceStore};

/// Downloads resource bytes for one account and places them in the store.
///
/// At most one transfer runs per resource; its [`Progress`] is shared with
/// every caller that asks for the same resource while it is active.
#[derive(Clone)]
pub struct ContentSync {
    inner: Arc<Inner>,
}

struct Inner {
    account_id: AccountId,
    base_url: Url,
    store: Arc<ResourceStore>,
    transport: Arc<dyn DownloadTransport>,
    events: EventSink,
    active: Mutex<HashMap<ResourceId, Progress>>,
}

impl ContentSync {
    pub fn new(
        account: &Account,
        store: Arc<ResourceStore>,
        transport: Arc<dyn DownloadTransport>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                account_id: account.id.clone(),
                base_url: account.url.clone(),
                store,
                transport,
                events,
                active: Mutex::default(),
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub async fn start_download(&self, id: &ResourceId) -> Result<Progress, SyncError> {
        if id.account_id != self.inner.account_id {
            return Err(SyncError::ForeignResource(id.clone()));
        }
        let mut active = self.inner.active.lock().await;
        if let Some(progress) = active.get(id) {
            debug!(resource = %id, "download already active");
            return Ok(progress.clone());
        }
        let progress = Progress::indeterminate();
        active.insert(id.clone(), progress.clone());
        drop(active);

        let url = url_for(&self.inner.base_url, &id.path);
        let inner = self.inner.clone();
        let staging = self.inner.store.staging_dir();
        let task_progress = progress.clone();
        let outcome: BoxFuture<'static, Result<DownloadedFile, DavError>> = Box::pin(async move {
            inner.transport.download(&url, &staging, &task_progress).await
        });
        self.inner.track(id.clone(), progress.clone(), outcome);
        Ok(progress)
    }

    pub async fn progress(&self, id: &ResourceId) -> Option<Progress> {
        self.inner.active.lock().await.get(id).cloned()
    }

    pub async fn all_progress(&self) -> HashMap<ResourceId, Progress> {
        self.inner.active.lock().await.clone()
    }

    /// Adopts transfers the transport was already running, returning how
    /// many were attached.
    pub async fn reconcile(&self) -> usize {
        let staging = self.inner.store.staging_dir();
        let mut attached = 0;
        for resumed in self.inner.transport.resume_in_flight(&staging).await {
            let Some(path) = path_relative_to(&resumed.url, &self.inner.base_url) else {
                warn!(url = %resumed.url, "in-flight download outside account root");
                continue;
            };
            let id = ResourceId::new(self.inner.account_id.clone(), path);
            {
                let mut active = self.inner.active.lock().await;
                if active.contains_key(&id) {
                    debug!(resource = %id, "in-flight download already tracked");
                    continue;
                }
                active.insert(id.clone(), resumed.progress.clone());
            }
            self.inner.track(id, resumed.progress, resumed.outcome);
            attached += 1;
        }
        attached
    }
}

impl Inner {
    fn track(
        self: &Arc<Self>,
        id: ResourceId,
        progress: Progress,
        outcome: BoxFuture<'static, Result<DownloadedFile, DavError>>,
    ) {
        self.events.send(SyncEvent::DownloadStarted {
            resource_id: id.clone(),
        });
        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = outcome.await;
            inner.finish(id, progress, outcome).await;
        });
    }

    async fn finish(
        &self,
        id: ResourceId,
        progress: Progress,
        outcome: Result<DownloadedFile, DavError>,
    ) {
        let event = match outcome {
            Ok(file) => match self.store.place_file(&file.temp, &file.version, &id).await {
                Ok(path) => {
                    // the bytes now live at `path`
                    if let Err(err) = file.temp.keep() {
                        warn!(resource = %id, error = %err.error, "staged path was not released");
                        // dropping the handle would delete the placed file
                        std::mem::forget(err.path);
                    }
                    progress.complete();
                    info!(resource = %id, path = %path.display(), "download finished");
                    SyncEvent::DownloadFinished {
                        resource_id: id.clone(),
                    }
                }
                Err(err) => {
                    warn!(resource = %id, error = %err, "downloaded file was not placed");
                    drop(file);
                    SyncEvent::DownloadFailed {
                        resource_id: id.clone(),
                        error: err.into(),
                    }
                }
            },
            Err(err) if matches!(err, DavError::Cancelled) || progress.is_cancelled() => {
                info!(resource = %id, "download cancelled");
                SyncEvent::DownloadCancelled {
                    resource_id: id.clone(),
                }
            }
            Err(err) => {
                warn!(resource = %id, error = %err, "download failed");
                SyncEvent::DownloadFailed {
                    resource_id: id.clone(),
                    error: err.into(),
                }
            }
        };

        self.active.lock().await.remove(&id);
        self.events.send(event);
    }
}
