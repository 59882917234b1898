use std::sync::Arc;

use cloudstore_core::{Authenticator, WebDavClient};

use super::content::ContentSync;
use super::credentials::{AccountCredentials, PasswordSource};
use super::events::EventSink;
use super::metadata::MetadataSync;
use super::transfer::TransferClient;
use crate::store::{Account, ResourceStore};

/// Both synchronizers of one account, wired to HTTP transports that answer
/// challenges with the account's credentials.
#[derive(Clone)]
pub struct AccountSession {
    pub account: Account,
    pub metadata: MetadataSync,
    pub content: ContentSync,
}

impl AccountSession {
    pub fn connect(
        account: Account,
        store: Arc<ResourceStore>,
        passwords: Arc<dyn PasswordSource>,
        download_concurrency: usize,
        events: EventSink,
    ) -> Self {
        let credentials = Arc::new(AccountCredentials::new(
            account.username.clone(),
            passwords,
        ));
        let listing = WebDavClient::with_authenticator(Authenticator::new(credentials.clone()));
        let transfers = TransferClient::with_authenticator(
            Authenticator::new(credentials),
            download_concurrency,
        );

        Self {
            metadata: MetadataSync::new(&account, store.clone(), Arc::new(listing), events.clone()),
            content: ContentSync::new(&account, store, Arc::new(transfers), events),
            account,
        }
    }
}
