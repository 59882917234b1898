use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::path::{Path, PathError};

pub type AccountId = String;

const URI_SCHEME: &str = "resource://";

// Everything that would change how a URI splits into account and segments.
const URI_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceIdError {
    #[error("resource uri must start with {URI_SCHEME}: {0}")]
    Scheme(String),
    #[error("resource uri has no account: {0}")]
    MissingAccount(String),
    #[error("resource uri has no path: {0}")]
    MissingPath(String),
    #[error("resource uri is not valid utf-8 after decoding: {0}")]
    Encoding(String),
    #[error("resource uri has an invalid path: {0}")]
    Path(#[from] PathError),
}

/// Address of a resource: the owning account plus its path below the account root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub account_id: AccountId,
    pub path: Path,
}

impl ResourceId {
    pub fn new(account_id: impl Into<AccountId>, path: Path) -> Self {
        Self {
            account_id: account_id.into(),
            path,
        }
    }

    pub fn root(account_id: impl Into<AccountId>) -> Self {
        Self::new(account_id, Path::root())
    }

    pub fn is_root(&self) -> bool {
        self.path.is_root()
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }

    pub fn parent(&self) -> Option<ResourceId> {
        self.path
            .parent()
            .map(|path| Self::new(self.account_id.clone(), path))
    }

    pub fn join(&self, name: impl Into<String>) -> Result<ResourceId, PathError> {
        Ok(Self::new(self.account_id.clone(), self.path.join(name)?))
    }

    pub fn ancestors(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.path
            .ancestors()
            .map(|path| Self::new(self.account_id.clone(), path))
    }

    pub fn is_parent_of(&self, other: &ResourceId) -> bool {
        self.account_id == other.account_id && self.path.is_parent_of(&other.path)
    }

    pub fn is_child_of(&self, other: &ResourceId) -> bool {
        self.account_id == other.account_id && self.path.is_child_of(&other.path)
    }

    pub fn is_ancestor_of(&self, other: &ResourceId) -> bool {
        self.account_id == other.account_id && self.path.is_ancestor_of(&other.path)
    }

    pub fn is_descendant_of(&self, other: &ResourceId) -> bool {
        self.account_id == other.account_id && self.path.is_descendant_of(&other.path)
    }

    /// Canonical `resource://<account>/<segments>` form.
    pub fn to_uri(&self) -> String {
        let mut uri = String::from(URI_SCHEME);
        uri.extend(utf8_percent_encode(&self.account_id, URI_COMPONENT));
        if self.path.is_root() {
            uri.push('/');
        }
        for segment in self.path.segments() {
            uri.push('/');
            uri.extend(utf8_percent_encode(segment, URI_COMPONENT));
        }
        uri
    }

    pub fn parse_uri(uri: &str) -> Result<Self, ResourceIdError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| ResourceIdError::Scheme(uri.to_string()))?;
        let (account, href) = rest
            .split_once('/')
            .ok_or_else(|| ResourceIdError::MissingPath(uri.to_string()))?;
        if account.is_empty() {
            return Err(ResourceIdError::MissingAccount(uri.to_string()));
        }
        let account_id = decode(account, uri)?;
        if href.is_empty() {
            return Ok(Self::root(account_id));
        }
        let segments = href
            .split('/')
            .map(|segment| decode(segment, uri))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(account_id, Path::new(segments)?))
    }
}

fn decode(component: &str, uri: &str) -> Result<String, ResourceIdError> {
    percent_decode_str(component)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| ResourceIdError::Encoding(uri.to_string()))
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for ResourceId {
    type Err = ResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_uri(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_uri())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uri = String::deserialize(deserializer)?;
        Self::parse_uri(&uri).map_err(serde::de::Error::custom)
    }
}

/// Remote URL of `path` below an account's base URL.
pub fn url_for(base: &Url, path: &Path) -> Url {
    let mut url = base.clone();
    if path.is_root() {
        return url;
    }
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(path.segments());
    }
    url
}

/// Inverse of [`url_for`]: the path of `url` below `base`, if `url` lies under it.
pub fn path_relative_to(url: &Url, base: &Url) -> Option<Path> {
    if url.scheme() != base.scheme()
        || url.host_str() != base.host_str()
        || url.port_or_known_default() != base.port_or_known_default()
        || url.username() != base.username()
    {
        return None;
    }
    let base_segments = decoded_segments(base)?;
    let segments = decoded_segments(url)?;
    let rest = segments.strip_prefix(base_segments.as_slice())?;
    Path::new(rest.iter().cloned()).ok()
}

fn decoded_segments(url: &Url) -> Option<Vec<String>> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8()
                .ok()
                .map(Cow::into_owned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(account: &str, segments: &[&str]) -> ResourceId {
        ResourceId::new(account, Path::new(segments.iter().copied()).unwrap())
    }

    #[test]
    fn uri_round_trips() {
        for resource in [
            id("acc-1", &[]),
            id("acc-1", &["Docs"]),
            id("acc-1", &["Docs", "Hello World.txt"]),
            id("acc-1", &["50% off", "a?b#c"]),
        ] {
            let uri = resource.to_uri();
            assert_eq!(ResourceId::parse_uri(&uri).unwrap(), resource);
            assert_eq!(ResourceId::parse_uri(&uri).unwrap().to_uri(), uri);
        }
        assert_eq!(id("acc-1", &[]).to_uri(), "resource://acc-1/");
        assert_eq!(id("acc-1", &["a", "b"]).to_uri(), "resource://acc-1/a/b");
    }

    #[test]
    fn parse_rejects_malformed_uris() {
        assert!(matches!(
            ResourceId::parse_uri("file://acc/a"),
            Err(ResourceIdError::Scheme(_))
        ));
        assert!(matches!(
            ResourceId::parse_uri("resource://acc"),
            Err(ResourceIdError::MissingPath(_))
        ));
        assert!(matches!(
            ResourceId::parse_uri("resource:///a"),
            Err(ResourceIdError::MissingAccount(_))
        ));
        assert!(matches!(
            ResourceId::parse_uri("resource://acc/a//b"),
            Err(ResourceIdError::Path(PathError::EmptySegment))
        ));
        assert!(matches!(
            ResourceId::parse_uri("resource://acc/.."),
            Err(ResourceIdError::Path(PathError::DotSegment(_)))
        ));
    }

    #[test]
    fn relations_require_same_account() {
        let a = id("one", &["a"]);
        let ab = id("one", &["a", "b"]);
        let other = id("two", &["a", "b"]);

        assert!(a.is_parent_of(&ab));
        assert!(a.is_ancestor_of(&ab));
        assert!(ab.is_child_of(&a));
        assert!(ab.is_descendant_of(&a));
        assert!(!a.is_parent_of(&other));
        assert!(!a.is_ancestor_of(&other));
        assert!(!other.is_descendant_of(&a));
    }

    #[test]
    fn maps_paths_to_urls_and_back() {
        let base = Url::parse("https://x/dav/").unwrap();
        let path = Path::new(["Docs", "Hello World.txt"]).unwrap();

        let url = url_for(&base, &path);
        assert_eq!(url.as_str(), "https://x/dav/Docs/Hello%20World.txt");
        assert_eq!(path_relative_to(&url, &base), Some(path));
        assert_eq!(url_for(&base, &Path::root()), base);
        assert_eq!(path_relative_to(&base, &base), Some(Path::root()));

        let collection = Url::parse("https://x/dav/Docs/").unwrap();
        assert_eq!(
            path_relative_to(&collection, &base),
            Some(Path::new(["Docs"]).unwrap())
        );
    }

    #[test]
    fn foreign_urls_have_no_relative_path() {
        let base = Url::parse("https://x/dav/").unwrap();
        for other in [
            "https://y/dav/a",
            "http://x/dav/a",
            "https://x:8443/dav/a",
            "https://x/other/a",
        ] {
            assert_eq!(path_relative_to(&Url::parse(other).unwrap(), &base), None);
        }
    }

    #[test]
    fn serializes_as_uri_string() {
        let resource = id("acc", &["a"]);
        let json = serde_json::to_string(&resource).unwrap();
        assert_eq!(json, "\"resource://acc/a\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resource);
    }
}
