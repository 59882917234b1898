use cloudstore_core::{AccountId, ResourceId};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use super::SyncError;
use crate::store::StoreChangeSet;

/// Notifications produced by the synchronizers for whoever hosts them.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ResourcesChanged {
        account_id: AccountId,
        changes: StoreChangeSet,
    },
    DownloadStarted {
        resource_id: ResourceId,
    },
    DownloadFinished {
        resource_id: ResourceId,
    },
    DownloadFailed {
        resource_id: ResourceId,
        error: SyncError,
    },
    DownloadCancelled {
        resource_id: ResourceId,
    },
}

/// Sending half of the event channel. A dropped receiver only silences events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<SyncEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("sync event receiver closed");
        }
    }
}
