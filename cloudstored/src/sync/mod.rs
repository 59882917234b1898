mod content;
mod credentials;
mod events;
mod metadata;
mod progress;
mod session;
mod transfer;
mod transport;

use std::sync::Arc;

use cloudstore_core::{DavError, ResourceId};
use thiserror::Error;

use crate::store::StoreError;

pub use content::ContentSync;
pub use credentials::{AccountCredentials, PasswordSource};
pub use events::{EventSink, SyncEvent};
pub use metadata::MetadataSync;
pub use progress::Progress;
pub use session::AccountSession;
pub use transfer::TransferClient;
pub use transport::{DownloadTransport, DownloadedFile, ListingTransport, ResumedDownload};

/// Outcome of a failed sync call. Cloneable so one result can be handed to
/// every caller waiting on the same request.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(Arc<StoreError>),
    #[error("transport error: {0}")]
    Transport(Arc<DavError>),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("sync task ended without a result")]
    Interrupted,
    #[error("{0} belongs to another account")]
    ForeignResource(ResourceId),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(Arc::new(err))
    }
}

impl From<DavError> for SyncError {
    fn from(err: DavError) -> Self {
        match err {
            DavError::Cancelled => SyncError::Cancelled,
            other => SyncError::Transport(Arc::new(other)),
        }
    }
}
