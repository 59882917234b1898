use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path segment is empty")]
    EmptySegment,
    #[error("path segment contains a separator: {0}")]
    Separator(String),
    #[error("path segment is a relative reference: {0}")]
    DotSegment(String),
}

/// Position of a resource below an account root, as a list of segments.
///
/// The root is the empty list. The canonical string form (`href`) is `/`
/// followed by the segments joined with `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments
            .into_iter()
            .map(|segment| validate_segment(segment.into()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Parses a canonical href. Empty segments (`//`, trailing `/`) and the
    /// relative references `.` and `..` are skipped.
    pub fn from_href(href: &str) -> Self {
        Self {
            segments: href
                .split('/')
                .filter(|segment| !matches!(*segment, "" | "." | ".."))
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn href(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn parent(&self) -> Option<Path> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    pub fn join(&self, name: impl Into<String>) -> Result<Path, PathError> {
        let mut segments = self.segments.clone();
        segments.push(validate_segment(name.into())?);
        Ok(Self { segments })
    }

    /// Ancestors from the direct parent up to and including the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.segments.len()).rev().map(|len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    pub fn is_parent_of(&self, other: &Path) -> bool {
        other.depth() == self.depth() + 1 && other.segments.starts_with(&self.segments)
    }

    pub fn is_child_of(&self, other: &Path) -> bool {
        other.is_parent_of(self)
    }

    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.depth() > self.depth() && other.segments.starts_with(&self.segments)
    }

    pub fn is_descendant_of(&self, other: &Path) -> bool {
        other.is_ancestor_of(self)
    }
}

fn validate_segment(segment: String) -> Result<String, PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if segment.contains('/') {
        return Err(PathError::Separator(segment));
    }
    if segment == "." || segment == ".." {
        return Err(PathError::DotSegment(segment));
    }
    Ok(segment)
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href())
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.href())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let href = String::deserialize(deserializer)?;
        Ok(Path::from_href(&href))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Path {
        Path::new(segments.iter().copied()).unwrap()
    }

    #[test]
    fn root_href_is_single_slash() {
        assert_eq!(Path::root().href(), "/");
        assert!(Path::root().is_root());
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn href_round_trips_through_parse() {
        let p = path(&["Docs", "Hello World.txt"]);
        assert_eq!(p.href(), "/Docs/Hello World.txt");
        assert_eq!(Path::from_href(&p.href()), p);
        assert_eq!(Path::from_href("/Docs/"), path(&["Docs"]));
    }

    #[test]
    fn rejects_invalid_segments() {
        assert_eq!(Path::new([""]), Err(PathError::EmptySegment));
        assert!(matches!(
            Path::root().join("a/b"),
            Err(PathError::Separator(_))
        ));
        assert_eq!(
            Path::new(["docs", ".."]),
            Err(PathError::DotSegment("..".into()))
        );
        assert_eq!(
            Path::root().join("."),
            Err(PathError::DotSegment(".".into()))
        );
        assert!(Path::root().join("..hidden").is_ok());
    }

    #[test]
    fn href_parse_skips_relative_references() {
        assert_eq!(Path::from_href("/docs/../a.txt"), path(&["docs", "a.txt"]));
        assert_eq!(Path::from_href("/./"), Path::root());
    }

    #[test]
    fn relations_exclude_self() {
        let a = path(&["a"]);
        let ab = path(&["a", "b"]);
        let abc = path(&["a", "b", "c"]);

        assert!(a.is_parent_of(&ab));
        assert!(!a.is_parent_of(&abc));
        assert!(ab.is_child_of(&a));
        assert!(a.is_ancestor_of(&abc));
        assert!(abc.is_descendant_of(&a));
        assert!(Path::root().is_ancestor_of(&a));

        assert!(!a.is_ancestor_of(&a));
        assert!(!a.is_descendant_of(&a));
        assert!(!a.is_parent_of(&a));
        assert!(!path(&["ab"]).is_descendant_of(&a));
    }

    #[test]
    fn ancestors_walk_up_to_root() {
        let abc = path(&["a", "b", "c"]);
        let ancestors: Vec<String> = abc.ancestors().map(|p| p.href()).collect();
        assert_eq!(ancestors, vec!["/a/b", "/a", "/"]);
        assert_eq!(Path::root().ancestors().count(), 0);
    }
}
