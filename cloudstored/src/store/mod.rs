mod files;
mod model;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path as FsPath, PathBuf};

use cloudstore_core::{Path, ResourceId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use files::Removals;
pub use files::{FileCache, PathError};
pub use model::{Account, FileState, Properties, Resource, StoreChangeSet};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RESOURCE_COLUMNS: &str = "href, is_collection, version, file_version, dirty, updated, modified, content_type, content_length";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource store is not open")]
    NotInitialized,
    #[error("version mismatch: expected {expected}, store has {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("resource does not exist: {0}")]
    ResourceDoesNotExist(ResourceId),
    #[error("account does not exist: {0}")]
    AccountDoesNotExist(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache path error: {0}")]
    Path(#[from] PathError),
    #[error("invalid path segment: {0}")]
    Segment(#[from] cloudstore_core::PathError),
    #[error("invalid account url: {0}")]
    Url(#[from] url::ParseError),
}

/// Persistent index of known resources plus the cache of their bytes.
///
/// Every operation, reads included, runs while holding the pool lock, so the
/// index and the file tree only ever see one writer.
pub struct ResourceStore {
    directory: PathBuf,
    files: FileCache,
    db: Mutex<Option<SqlitePool>>,
}

struct RowState {
    is_collection: bool,
    version: String,
    dirty: bool,
}

impl ResourceStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            files: FileCache::new(directory.join("files")),
            directory,
            db: Mutex::new(None),
        }
    }

    /// Download targets live here so placement stays on one filesystem.
    pub fn staging_dir(&self) -> PathBuf {
        self.directory.join("staging")
    }

    pub async fn open(&self) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        if db.is_some() {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.files.root()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;

        let options = SqliteConnectOptions::new()
            .filename(self.directory.join("index.db"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        *db = Some(pool);
        info!(directory = %self.directory.display(), "resource store opened");
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = self.db.lock().await.take() {
            pool.close().await;
            info!(directory = %self.directory.display(), "resource store closed");
        }
    }

    /// Applies one server listing of `id`.
    ///
    /// `properties == None` means the server reported the resource as gone.
    /// `children` is the full set of immediate children when the listing
    /// included them.
    pub async fn apply_listing(
        &self,
        id: &ResourceId,
        properties: Option<&Properties>,
        children: Option<&BTreeMap<String, Properties>>,
    ) -> Result<StoreChangeSet, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut tx = pool.begin().await?;
        let mut changes = StoreChangeSet::default();
        let mut removals = Removals::default();

        match properties {
            None => remove_resource(&mut tx, &self.files, &mut removals, id, &mut changes).await?,
            Some(properties) => {
                let existing = fetch_state(&mut tx, id).await?;
                let up_to_date = existing.as_ref().is_some_and(|state| {
                    !state.dirty
                        && state.version == properties.version
                        && state.is_collection == properties.is_collection
                });
                if up_to_date {
                    sqlx::query("UPDATE resources SET updated = ?3 WHERE account_id = ?1 AND href = ?2")
                        .bind(&id.account_id)
                        .bind(id.path.href())
                        .bind(now_unix())
                        .execute(&mut *tx)
                        .await?;
                    changes.inserted_or_updated.push(id.clone());
                } else {
                    let dirty = properties.is_collection && children.is_none();
                    write_resource(
                        &mut tx,
                        &self.files,
                        &mut removals,
                        id,
                        existing.as_ref(),
                        properties,
                        dirty,
                    )
                    .await?;
                    changes.inserted_or_updated.push(id.clone());
                    invalidate_ancestors(&mut tx, &self.files, &mut removals, id).await?;

                    if !properties.is_collection {
                        clear_subtree(&mut tx, &self.files, &mut removals, id).await?;
                    } else if let Some(children) = children {
                        reconcile_children(
                            &mut tx,
                            &self.files,
                            &mut removals,
                            id,
                            children,
                            &mut changes,
                        )
                        .await?;
                    }
                }
            }
        }

        tx.commit().await?;
        removals.run().await;
        debug!(
            resource = %id,
            updated = changes.inserted_or_updated.len(),
            deleted = changes.deleted.len(),
            "listing applied"
        );
        Ok(changes)
    }

    /// Moves downloaded bytes into the cache slot of `id`, provided the
    /// stored version is still `expected_version`. On any error the file at
    /// `temp` is left for the caller.
    pub async fn place_file(
        &self,
        temp: &FsPath,
        expected_version: &str,
        id: &ResourceId,
    ) -> Result<PathBuf, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut tx = pool.begin().await?;

        let state = fetch_state(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::ResourceDoesNotExist(id.clone()))?;
        if state.version != expected_version {
            return Err(StoreError::VersionMismatch {
                expected: expected_version.to_string(),
                actual: state.version,
            });
        }
        if state.is_collection {
            return Err(StoreError::Internal(format!(
                "cannot place file contents at collection {id}"
            )));
        }

        let target = self.files.place(temp, id).await?;
        sqlx::query("UPDATE resources SET file_version = ?3 WHERE account_id = ?1 AND href = ?2")
            .bind(&id.account_id)
            .bind(id.path.href())
            .bind(expected_version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(resource = %id, version = expected_version, "file placed");
        Ok(target)
    }

    /// Returns the stored row, or a synthetic dirty collection for an account
    /// root that was never listed.
    pub async fn get(&self, id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut conn = pool.acquire().await?;

        if let Some(resource) = fetch_resource(&mut conn, &self.files, id).await? {
            return Ok(Some(resource));
        }
        if !id.is_root() {
            return Ok(None);
        }
        Ok(Some(Resource {
            id: id.clone(),
            properties: Properties::collection(uuid::Uuid::new_v4().to_string()),
            dirty: true,
            updated: None,
            file_version: None,
            file_path: None,
        }))
    }

    pub async fn children(&self, id: &ResourceId) -> Result<Vec<Resource>, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut conn = pool.acquire().await?;
        fetch_children(&mut conn, &self.files, id).await
    }

    pub async fn add_account(
        &self,
        url: &Url,
        username: &str,
        label: Option<&str>,
    ) -> Result<Account, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;

        let mut url = url.clone();
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let account = Account {
            id: uuid::Uuid::new_v4().to_string(),
            url,
            username: username.to_string(),
            label: label.map(str::to_string),
        };
        sqlx::query("INSERT INTO accounts (id, url, username, label) VALUES (?1, ?2, ?3, ?4)")
            .bind(&account.id)
            .bind(account.url.as_str())
            .bind(&account.username)
            .bind(&account.label)
            .execute(pool)
            .await?;
        info!(account = %account.id, url = %account.url, "account added");
        Ok(account)
    }

    pub async fn update_label(
        &self,
        account_id: &str,
        label: Option<&str>,
    ) -> Result<Account, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let result = sqlx::query("UPDATE accounts SET label = ?2 WHERE id = ?1")
            .bind(account_id)
            .bind(label)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AccountDoesNotExist(account_id.to_string()));
        }
        fetch_account(pool, account_id)
            .await?
            .ok_or_else(|| StoreError::Internal(format!("account {account_id} vanished after update")))
    }

    /// Deletes the account with every resource row and cached file under it.
    pub async fn remove_account(&self, account_id: &str) -> Result<StoreChangeSet, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut tx = pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM accounts WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::AccountDoesNotExist(account_id.to_string()));
        }

        let rows = sqlx::query("SELECT href FROM resources WHERE account_id = ?1 ORDER BY href")
            .bind(account_id)
            .fetch_all(&mut *tx)
            .await?;
        let mut changes = StoreChangeSet::default();
        for row in rows {
            let href: String = row.try_get("href")?;
            changes
                .deleted
                .push(ResourceId::new(account_id, Path::from_href(&href)));
        }

        sqlx::query("DELETE FROM resources WHERE account_id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        let account_dir = self.files.account_dir(account_id)?;
        tx.commit().await?;
        let mut removals = Removals::default();
        removals.entry(account_dir);
        removals.run().await;
        info!(account = account_id, resources = changes.deleted.len(), "account removed");
        Ok(changes)
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        let rows = sqlx::query("SELECT id, url, username, label FROM accounts ORDER BY rowid")
            .fetch_all(pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let db = self.db.lock().await;
        let pool = db.as_ref().ok_or(StoreError::NotInitialized)?;
        fetch_account(pool, account_id).await
    }
}

async fn fetch_account(pool: &SqlitePool, account_id: &str) -> Result<Option<Account>, StoreError> {
    let row = sqlx::query("SELECT id, url, username, label FROM accounts WHERE id = ?1")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StoreError> {
    let url: String = row.try_get("url")?;
    Ok(Account {
        id: row.try_get("id")?,
        url: Url::parse(&url)?,
        username: row.try_get("username")?,
        label: row.try_get("label")?,
    })
}

fn resource_from_row(
    account_id: &str,
    row: &SqliteRow,
    files: &FileCache,
) -> Result<Resource, StoreError> {
    let href: String = row.try_get("href")?;
    let is_collection: i64 = row.try_get("is_collection")?;
    let dirty: i64 = row.try_get("dirty")?;
    let content_length: Option<i64> = row.try_get("content_length")?;
    let file_version: Option<String> = row.try_get("file_version")?;

    let id = ResourceId::new(account_id, Path::from_href(&href));
    let file_path = match file_version {
        Some(_) => Some(files.path_for(&id)?),
        None => None,
    };
    Ok(Resource {
        properties: Properties {
            is_collection: is_collection != 0,
            version: row.try_get("version")?,
            content_type: row.try_get("content_type")?,
            content_length: content_length.and_then(|len| u64::try_from(len).ok()),
            modified: row.try_get("modified")?,
        },
        dirty: dirty != 0,
        updated: row.try_get("updated")?,
        file_version,
        file_path,
        id,
    })
}

async fn fetch_state(
    conn: &mut SqliteConnection,
    id: &ResourceId,
) -> Result<Option<RowState>, StoreError> {
    let row = sqlx::query(
        "SELECT is_collection, version, dirty FROM resources WHERE account_id = ?1 AND href = ?2",
    )
    .bind(&id.account_id)
    .bind(id.path.href())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let is_collection: i64 = row.try_get("is_collection")?;
    let dirty: i64 = row.try_get("dirty")?;
    Ok(Some(RowState {
        is_collection: is_collection != 0,
        version: row.try_get("version")?,
        dirty: dirty != 0,
    }))
}

async fn fetch_resource(
    conn: &mut SqliteConnection,
    files: &FileCache,
    id: &ResourceId,
) -> Result<Option<Resource>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources WHERE account_id = ?1 AND href = ?2"
    ))
    .bind(&id.account_id)
    .bind(id.path.href())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| resource_from_row(&id.account_id, &row, files))
        .transpose()
}

async fn fetch_children(
    conn: &mut SqliteConnection,
    files: &FileCache,
    id: &ResourceId,
) -> Result<Vec<Resource>, StoreError> {
    let (low, high) = subtree_bounds(&id.path);
    let rows = sqlx::query(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources
         WHERE account_id = ?1 AND depth = ?2 AND href >= ?3 AND href < ?4
         ORDER BY href ASC"
    ))
    .bind(&id.account_id)
    .bind(depth(&id.path) + 1)
    .bind(low)
    .bind(high)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| resource_from_row(&id.account_id, row, files))
        .collect()
}

async fn descendant_ids(
    conn: &mut SqliteConnection,
    id: &ResourceId,
) -> Result<Vec<ResourceId>, StoreError> {
    let (low, high) = subtree_bounds(&id.path);
    let rows = sqlx::query(
        "SELECT href FROM resources
         WHERE account_id = ?1 AND depth > ?2 AND href >= ?3 AND href < ?4
         ORDER BY href ASC",
    )
    .bind(&id.account_id)
    .bind(depth(&id.path))
    .bind(low)
    .bind(high)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let href: String = row.try_get("href")?;
        out.push(ResourceId::new(id.account_id.clone(), Path::from_href(&href)));
    }
    Ok(out)
}

async fn delete_descendants(conn: &mut SqliteConnection, id: &ResourceId) -> Result<(), StoreError> {
    let (low, high) = subtree_bounds(&id.path);
    sqlx::query(
        "DELETE FROM resources WHERE account_id = ?1 AND depth > ?2 AND href >= ?3 AND href < ?4",
    )
    .bind(&id.account_id)
    .bind(depth(&id.path))
    .bind(low)
    .bind(high)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Removes `id` and its whole subtree, reporting every removed row. Cached
/// bytes go once the transaction commits.
async fn remove_resource(
    conn: &mut SqliteConnection,
    files: &FileCache,
    removals: &mut Removals,
    id: &ResourceId,
    changes: &mut StoreChangeSet,
) -> Result<(), StoreError> {
    let existed = fetch_state(conn, id).await?.is_some();
    let descendants = descendant_ids(conn, id).await?;

    delete_descendants(conn, id).await?;
    sqlx::query("DELETE FROM resources WHERE account_id = ?1 AND href = ?2")
        .bind(&id.account_id)
        .bind(id.path.href())
        .execute(&mut *conn)
        .await?;
    removals.entry(files.path_for(id)?);

    if existed {
        changes.deleted.push(id.clone());
    }
    changes.deleted.extend(descendants);
    Ok(())
}

/// Drops rows beneath `id` without reporting them, scheduling their bytes.
async fn clear_subtree(
    conn: &mut SqliteConnection,
    files: &FileCache,
    removals: &mut Removals,
    id: &ResourceId,
) -> Result<(), StoreError> {
    delete_descendants(conn, id).await?;
    removals.below(files.path_for(id)?);
    Ok(())
}

async fn write_resource(
    conn: &mut SqliteConnection,
    files: &FileCache,
    removals: &mut Removals,
    id: &ResourceId,
    existing: Option<&RowState>,
    properties: &Properties,
    dirty: bool,
) -> Result<(), StoreError> {
    if existing.is_some_and(|existing| existing.is_collection != properties.is_collection) {
        debug!(resource = %id, "resource changed type");
        removals.entry(files.path_for(id)?);
        sqlx::query("UPDATE resources SET file_version = NULL WHERE account_id = ?1 AND href = ?2")
            .bind(&id.account_id)
            .bind(id.path.href())
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query(
        "
        INSERT INTO resources (
            account_id,
            href,
            depth,
            is_collection,
            version,
            dirty,
            updated,
            modified,
            content_type,
            content_length
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(account_id, href) DO UPDATE SET
            is_collection = excluded.is_collection,
            version = excluded.version,
            dirty = excluded.dirty,
            updated = excluded.updated,
            modified = excluded.modified,
            content_type = excluded.content_type,
            content_length = excluded.content_length;
        ",
    )
    .bind(&id.account_id)
    .bind(id.path.href())
    .bind(depth(&id.path))
    .bind(i64::from(properties.is_collection))
    .bind(&properties.version)
    .bind(i64::from(dirty))
    .bind(now_unix())
    .bind(properties.modified)
    .bind(&properties.content_type)
    .bind(properties.content_length.and_then(|len| i64::try_from(len).ok()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Marks every ancestor of `id` dirty, creating stub collections where
/// missing. A leaf ancestor becomes a collection and its cached file is
/// scheduled for removal.
async fn invalidate_ancestors(
    conn: &mut SqliteConnection,
    files: &FileCache,
    removals: &mut Removals,
    id: &ResourceId,
) -> Result<(), StoreError> {
    for ancestor in id.ancestors() {
        match fetch_state(conn, &ancestor).await? {
            None => {
                sqlx::query(
                    "INSERT INTO resources (account_id, href, depth, is_collection, version, dirty)
                     VALUES (?1, ?2, ?3, 1, '', 1)",
                )
                .bind(&ancestor.account_id)
                .bind(ancestor.path.href())
                .bind(depth(&ancestor.path))
                .execute(&mut *conn)
                .await?;
            }
            Some(state) if !state.is_collection => {
                removals.entry(files.path_for(&ancestor)?);
                sqlx::query(
                    "UPDATE resources
                     SET is_collection = 1, dirty = 1, file_version = NULL, content_type = NULL, content_length = NULL
                     WHERE account_id = ?1 AND href = ?2",
                )
                .bind(&ancestor.account_id)
                .bind(ancestor.path.href())
                .execute(&mut *conn)
                .await?;
            }
            Some(_) => {
                sqlx::query("UPDATE resources SET dirty = 1 WHERE account_id = ?1 AND href = ?2")
                    .bind(&ancestor.account_id)
                    .bind(ancestor.path.href())
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn reconcile_children(
    conn: &mut SqliteConnection,
    files: &FileCache,
    removals: &mut Removals,
    id: &ResourceId,
    children: &BTreeMap<String, Properties>,
    changes: &mut StoreChangeSet,
) -> Result<(), StoreError> {
    let mut existing = HashMap::new();
    for child in fetch_children(conn, files, id).await? {
        if let Some(name) = child.id.name() {
            existing.insert(name.to_string(), child);
        }
    }

    for (name, child) in &existing {
        if !children.contains_key(name) {
            remove_resource(conn, files, removals, &child.id, changes).await?;
        }
    }

    for (name, properties) in children {
        let child_id = id.join(name.clone())?;
        let state = existing.get(name).map(|child| RowState {
            is_collection: child.is_collection(),
            version: child.version().to_string(),
            dirty: child.dirty,
        });
        if state.as_ref().is_some_and(|state| {
            state.version == properties.version && state.is_collection == properties.is_collection
        }) {
            continue;
        }

        write_resource(
            conn,
            files,
            removals,
            &child_id,
            state.as_ref(),
            properties,
            properties.is_collection,
        )
        .await?;
        changes.inserted_or_updated.push(child_id.clone());
        if !properties.is_collection {
            clear_subtree(conn, files, removals, &child_id).await?;
        }
    }
    Ok(())
}

/// Half-open href range `[low, high)` holding every descendant of `path`.
/// `'0'` is the byte right after `'/'`.
fn subtree_bounds(path: &Path) -> (String, String) {
    if path.is_root() {
        return ("/".to_string(), "0".to_string());
    }
    let href = path.href();
    (format!("{href}/"), format!("{href}0"))
}

fn depth(path: &Path) -> i64 {
    path.depth() as i64
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
