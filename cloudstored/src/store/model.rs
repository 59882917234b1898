use std::path::PathBuf;

use cloudstore_core::{AccountId, Path, ResourceId};
use serde::{Deserialize, Serialize};
use url::Url;

/// A remote tree root together with the user it is accessed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub url: Url,
    pub username: String,
    pub label: Option<String>,
}

impl Account {
    pub fn root(&self) -> ResourceId {
        ResourceId::root(self.id.clone())
    }

    pub fn resource(&self, path: Path) -> ResourceId {
        ResourceId::new(self.id.clone(), path)
    }
}

/// Server-reported properties of a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    pub is_collection: bool,
    pub version: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub modified: Option<i64>,
}

impl Properties {
    pub fn collection(version: impl Into<String>) -> Self {
        Self {
            is_collection: true,
            version: version.into(),
            content_type: None,
            content_length: None,
            modified: None,
        }
    }

    pub fn file(version: impl Into<String>) -> Self {
        Self {
            is_collection: false,
            ..Self::collection(version)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    None,
    Outdated,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub properties: Properties,
    pub dirty: bool,
    pub updated: Option<i64>,
    pub file_version: Option<String>,
    /// Location of the cached bytes, present while a file version is recorded.
    pub file_path: Option<PathBuf>,
}

impl Resource {
    pub fn is_collection(&self) -> bool {
        self.properties.is_collection
    }

    pub fn version(&self) -> &str {
        &self.properties.version
    }

    pub fn file_state(&self) -> FileState {
        match &self.file_version {
            None => FileState::None,
            Some(version) if *version == self.properties.version => FileState::Valid,
            Some(_) => FileState::Outdated,
        }
    }
}

/// Resources touched by one store mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChangeSet {
    pub inserted_or_updated: Vec<ResourceId>,
    pub deleted: Vec<ResourceId>,
}

impl StoreChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted_or_updated.is_empty() && self.deleted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(version: &str, file_version: Option<&str>) -> Resource {
        Resource {
            id: ResourceId::root("acc"),
            properties: Properties::file(version),
            dirty: false,
            updated: None,
            file_version: file_version.map(str::to_string),
            file_path: None,
        }
    }

    #[test]
    fn file_state_is_derived_from_versions() {
        assert_eq!(resource("1", None).file_state(), FileState::None);
        assert_eq!(resource("1", Some("1")).file_state(), FileState::Valid);
        assert_eq!(resource("2", Some("1")).file_state(), FileState::Outdated);
    }

    #[test]
    fn change_set_serializes_resource_uris() {
        let changes = StoreChangeSet {
            inserted_or_updated: vec![ResourceId::root("acc")],
            deleted: vec![],
        };
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"inserted_or_updated": ["resource://acc/"], "deleted": []})
        );
    }
}
