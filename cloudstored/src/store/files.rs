use std::io;
use std::path::{Component, Path, PathBuf};

use cloudstore_core::ResourceId;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path component is not a plain file name: {0}")]
    UnsupportedComponent(String),
}

/// On-disk layout of cached bytes: `<root>/<account>/<segment>/…`.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn account_dir(&self, account_id: &str) -> Result<PathBuf, PathError> {
        let mut out = self.root.clone();
        push_component(&mut out, account_id)?;
        Ok(out)
    }

    pub fn path_for(&self, id: &ResourceId) -> Result<PathBuf, PathError> {
        let mut out = self.account_dir(&id.account_id)?;
        for segment in id.path.segments() {
            push_component(&mut out, segment)?;
        }
        Ok(out)
    }

    /// Moves `temp` into the slot for `id` with a single rename, so readers see
    /// either the old file or the complete new one.
    pub async fn place(&self, temp: &Path, id: &ResourceId) -> Result<PathBuf, super::StoreError> {
        let target = self.path_for(id)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(temp, &target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                let partial = partial_path(&target);
                tokio::fs::copy(temp, &partial).await?;
                tokio::fs::rename(&partial, &target).await?;
                remove_entry(temp).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(target)
    }
}

/// Cache entries orphaned by an index change, removed only after that change
/// has been committed. Until then the bytes stay where the index expects them.
#[derive(Debug, Default)]
pub struct Removals {
    entries: Vec<Removal>,
}

#[derive(Debug)]
enum Removal {
    Entry(PathBuf),
    Below(PathBuf),
}

impl Removals {
    /// Schedules removal of whatever is cached at `path`, file or directory.
    pub fn entry(&mut self, path: PathBuf) {
        self.entries.push(Removal::Entry(path));
    }

    /// Schedules removal of cached descendants of `path`, keeping a cached
    /// file at `path` itself.
    pub fn below(&mut self, path: PathBuf) {
        self.entries.push(Removal::Below(path));
    }

    pub async fn run(self) {
        for removal in self.entries {
            let result = match &removal {
                Removal::Entry(path) => remove_entry(path).await,
                Removal::Below(path) => remove_below(path).await,
            };
            if let Err(err) = result {
                warn!(?removal, error = %err, "failed to remove cached entry");
            }
        }
    }
}

fn push_component(out: &mut PathBuf, part: &str) -> Result<(), PathError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == part => {
            out.push(name);
            Ok(())
        }
        _ => Err(PathError::UnsupportedComponent(part.to_string())),
    }
}

async fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_below(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => remove_entry(path).await,
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
