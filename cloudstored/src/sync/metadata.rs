use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cloudstore_core::{AccountId, DavEntry, Listing, ResourceId, path_relative_to, url_for};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::SyncError;
use super::events::{EventSink, SyncEvent};
use super::transport::ListingTransport;
use crate::store::{Account, Properties, ResourceStore};

type Waiter = oneshot::Sender<Result<(), SyncError>>;

/// Keeps the store's view of one account in line with server listings.
///
/// Concurrent refreshes of the same resource share one request.
#[derive(Clone)]
pub struct MetadataSync {
    inner: Arc<Inner>,
}

struct Inner {
    account_id: AccountId,
    base_url: Url,
    store: Arc<ResourceStore>,
    transport: Arc<dyn ListingTransport>,
    events: EventSink,
    pending: Mutex<HashMap<ResourceId, Vec<Waiter>>>,
    apply: Mutex<()>,
}

impl MetadataSync {
    pub fn new(
        account: &Account,
        store: Arc<ResourceStore>,
        transport: Arc<dyn ListingTransport>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                account_id: account.id.clone(),
                base_url: account.url.clone(),
                store,
                transport,
                events,
                pending: Mutex::default(),
                apply: Mutex::default(),
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// Lists `id` one level deep and applies the result to the store.
    pub async fn refresh(&self, id: &ResourceId) -> Result<(), SyncError> {
        if id.account_id != self.inner.account_id {
            return Err(SyncError::ForeignResource(id.clone()));
        }
        let rx = self.enqueue(id).await;
        rx.await.unwrap_or(Err(SyncError::Interrupted))
    }

    /// Starts a refresh in the background and reports its outcome to `on_complete`.
    pub fn refresh_with<F>(&self, id: ResourceId, on_complete: F)
    where
        F: FnOnce(Result<(), SyncError>) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            on_complete(this.refresh(&id).await);
        });
    }

    async fn enqueue(&self, id: &ResourceId) -> oneshot::Receiver<Result<(), SyncError>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.pending.lock().await;
        match pending.get_mut(id) {
            Some(waiters) => {
                debug!(resource = %id, "joining in-flight refresh");
                waiters.push(tx);
            }
            None => {
                pending.insert(id.clone(), vec![tx]);
                let inner = self.inner.clone();
                let id = id.clone();
                tokio::spawn(async move { inner.run(id).await });
            }
        }
        rx
    }

    #[cfg(test)]
    async fn waiting(&self, id: &ResourceId) -> usize {
        self.inner.pending.lock().await.get(id).map_or(0, Vec::len)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, id: ResourceId) {
        let outcome = self.fetch_and_apply(&id).await;
        if let Err(err) = &outcome {
            let class = match err {
                SyncError::Transport(err) => err.classification(),
                _ => None,
            };
            warn!(resource = %id, error = %err, ?class, "refresh failed");
        }
        let waiters = self.pending.lock().await.remove(&id).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn fetch_and_apply(&self, id: &ResourceId) -> Result<(), SyncError> {
        let url = url_for(&self.base_url, &id.path);
        let listing = self.transport.list_one_level(&url).await?;

        let _serial = self.apply.lock().await;
        let changes = match listing {
            Listing::NotFound => {
                debug!(resource = %id, "resource is gone on the server");
                self.store.apply_listing(id, None, None).await?
            }
            Listing::MultiStatus(entries) => {
                let (properties, children) = split_listing(id, &self.base_url, entries);
                self.store
                    .apply_listing(id, properties.as_ref(), Some(&children))
                    .await?
            }
        };
        info!(
            resource = %id,
            updated = changes.inserted_or_updated.len(),
            deleted = changes.deleted.len(),
            "refresh finished"
        );
        self.events.send(SyncEvent::ResourcesChanged {
            account_id: self.account_id.clone(),
            changes,
        });
        Ok(())
    }
}

/// Separates the listed resource itself from its immediate children. Entries
/// without a version or outside the account are dropped.
fn split_listing(
    id: &ResourceId,
    base_url: &Url,
    entries: Vec<DavEntry>,
) -> (Option<Properties>, BTreeMap<String, Properties>) {
    let mut own = None;
    let mut children = BTreeMap::new();

    for entry in entries {
        let Some(path) = path_relative_to(&entry.url, base_url) else {
            debug!(url = %entry.url, "listing entry outside account root");
            continue;
        };
        let Some(version) = entry.version else {
            debug!(url = %entry.url, "listing entry without etag");
            continue;
        };
        let properties = Properties {
            is_collection: entry.is_collection,
            version,
            content_type: entry.content_type,
            content_length: entry.content_length,
            modified: entry.modified,
        };

        if path == id.path {
            own = Some(properties);
        } else if id.path.is_parent_of(&path) {
            if let Some(name) = path.name() {
                children.insert(name.to_string(), properties);
            }
        }
    }
    (own, children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cloudstore_core::{DavError, Path};
    use reqwest::StatusCode;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::Semaphore;

    type Respond = Box<dyn Fn(&Url) -> Result<Listing, DavError> + Send + Sync>;

    struct FakeListing {
        respond: Respond,
        calls: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeListing {
        fn new(respond: impl Fn(&Url) -> Result<Listing, DavError> + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl ListingTransport for FakeListing {
        async fn list_one_level(&self, url: &Url) -> Result<Listing, DavError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            (self.respond)(url)
        }
    }

    fn entry(url: &str, version: Option<&str>, is_collection: bool) -> DavEntry {
        DavEntry {
            url: Url::parse(url).unwrap(),
            version: version.map(str::to_string),
            is_collection,
            content_type: None,
            content_length: None,
            modified: None,
        }
    }

    fn root_listing(_: &Url) -> Result<Listing, DavError> {
        Ok(Listing::MultiStatus(vec![
            entry("https://x/dav/", Some("r1"), true),
            entry("https://x/dav/a", Some("123"), false),
            entry("https://x/dav/docs/", Some("d1"), true),
            entry("https://x/dav/docs/deep", Some("9"), false),
            entry("https://x/dav/noetag", None, false),
            entry("https://elsewhere/dav/b", Some("1"), false),
        ]))
    }

    async fn setup(
        transport: Arc<FakeListing>,
    ) -> (TempDir, Arc<ResourceStore>, Account, MetadataSync, tokio::sync::mpsc::UnboundedReceiver<SyncEvent>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ResourceStore::new(dir.path()));
        store.open().await.unwrap();
        let account = store
            .add_account(&Url::parse("https://x/dav/").unwrap(), "alice", None)
            .await
            .unwrap();
        let (events, rx) = EventSink::channel();
        let sync = MetadataSync::new(&account, store.clone(), transport, events);
        (dir, store, account, sync, rx)
    }

    #[test]
    fn splits_self_from_immediate_children() {
        let base = Url::parse("https://x/dav/").unwrap();
        let Ok(Listing::MultiStatus(entries)) = root_listing(&base) else {
            unreachable!()
        };
        let (own, children) = split_listing(&ResourceId::root("acc"), &base, entries);

        assert_eq!(own, Some(Properties::collection("r1")));
        assert_eq!(
            children.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "docs"]
        );
        assert_eq!(children["a"], Properties::file("123"));
    }

    #[tokio::test]
    async fn refresh_applies_listing_and_reports_changes() {
        let transport = Arc::new(FakeListing::new(root_listing));
        let (_dir, store, account, sync, mut rx) = setup(transport.clone()).await;
        let root = account.root();

        sync.refresh(&root).await.unwrap();

        let stored = store.get(&root).await.unwrap().unwrap();
        assert_eq!(stored.version(), "r1");
        assert!(!stored.dirty);
        let names: Vec<_> = store
            .children(&root)
            .await
            .unwrap()
            .into_iter()
            .map(|child| child.id.path.href())
            .collect();
        assert_eq!(names, vec!["/a", "/docs"]);

        match rx.recv().await {
            Some(SyncEvent::ResourcesChanged {
                account_id,
                changes,
            }) => {
                assert_eq!(account_id, account.id);
                assert_eq!(
                    changes.inserted_or_updated,
                    vec![
                        root.clone(),
                        account.resource(Path::from_href("/a")),
                        account.resource(Path::from_href("/docs")),
                    ]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_removes_resource() {
        let transport = Arc::new(FakeListing::new(|url: &Url| {
            if url.path() == "/dav/" {
                root_listing(url)
            } else {
                Ok(Listing::NotFound)
            }
        }));
        let (_dir, store, account, sync, _rx) = setup(transport).await;
        let a = account.resource(Path::from_href("/a"));

        sync.refresh(&account.root()).await.unwrap();
        assert!(store.get(&a).await.unwrap().is_some());

        sync.refresh(&a).await.unwrap();
        assert!(store.get(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_error_leaves_store_untouched() {
        let transport = Arc::new(FakeListing::new(|_: &Url| {
            Err(DavError::Api {
                status: StatusCode::BAD_GATEWAY,
                body: String::new(),
            })
        }));
        let (_dir, store, account, sync, mut rx) = setup(transport).await;

        let err = sync.refresh(&account.root()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(store.get(&account.root()).await.unwrap().unwrap().dirty);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_request() {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Arc::new(FakeListing::new(root_listing).gated(gate.clone()));
        let (_dir, _store, account, sync, _rx) = setup(transport.clone()).await;
        let root = account.root();

        let refreshes = futures_util::future::join_all((0..5).map(|_| sync.refresh(&root)));
        let release = async {
            while sync.waiting(&root).await < 5 {
                tokio::task::yield_now().await;
            }
            gate.add_permits(1);
        };
        let (results, ()) = tokio::join!(refreshes, release);

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sync.waiting(&root).await, 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_failure() {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Arc::new(
            FakeListing::new(|_: &Url| {
                Err(DavError::Api {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: String::new(),
                })
            })
            .gated(gate.clone()),
        );
        let (_dir, _store, account, sync, _rx) = setup(transport.clone()).await;
        let root = account.root();

        let refreshes = futures_util::future::join_all((0..5).map(|_| sync.refresh(&root)));
        let release = async {
            while sync.waiting(&root).await < 5 {
                tokio::task::yield_now().await;
            }
            gate.add_permits(1);
        };
        let (results, ()) = tokio::join!(refreshes, release);

        let errors: Vec<_> = results
            .into_iter()
            .map(|result| match result {
                Err(SyncError::Transport(err)) => err,
                other => panic!("unexpected outcome: {other:?}"),
            })
            .collect();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|err| Arc::ptr_eq(err, &errors[0])));
        assert!(matches!(
            errors[0].as_ref(),
            DavError::Api { status, .. } if *status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sync.waiting(&root).await, 0);
    }

    #[tokio::test]
    async fn refresh_with_reports_through_callback() {
        let transport = Arc::new(FakeListing::new(root_listing));
        let (_dir, _store, account, sync, _rx) = setup(transport).await;

        let (tx, rx) = oneshot::channel();
        sync.refresh_with(account.root(), move |outcome| {
            let _ = tx.send(outcome);
        });
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rejects_resources_of_other_accounts() {
        let transport = Arc::new(FakeListing::new(root_listing));
        let (_dir, _store, _account, sync, _rx) = setup(transport.clone()).await;

        let err = sync.refresh(&ResourceId::root("other")).await.unwrap_err();
        assert!(matches!(err, SyncError::ForeignResource(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
