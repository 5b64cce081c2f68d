//! Normalized logical paths.
//!
//! A [`VfsPath`] names a node in the composite tree: `/`-delimited, no
//! leading slash, no trailing slash, root is the empty string. Every layer
//! of the system — delegates, the resolution engine, handles, attribute
//! keys — speaks this one form, so normalization happens exactly once, at
//! the boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path separator for logical paths.
pub const SEPARATOR: char = '/';

/// Extension separator for data file names.
pub const EXT_SEPARATOR: char = '.';

/// Error from parsing a logical path or child name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// A path component was empty (`a//b`, trailing `/`, etc. after trimming).
    #[error("empty path component in {0:?}")]
    EmptyComponent(String),

    /// A child name contained the path separator.
    #[error("name contains path separator: {0:?}")]
    SeparatorInName(String),
}

/// A normalized logical path in the composite tree.
///
/// Invariants: no leading or trailing separator, components are non-empty
/// and never contain `/`. The root is the empty string.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VfsPath(String);

impl VfsPath {
    /// The root path (empty string).
    pub fn root() -> Self {
        VfsPath(String::new())
    }

    /// Parse and normalize a raw string into a path.
    ///
    /// Leading and trailing separators are trimmed; `""` and `"/"` both
    /// parse to the root. Interior empty components are rejected rather
    /// than collapsed — `a//b` is a caller bug, not a spelling variant.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.split(SEPARATOR).any(str::is_empty) {
            return Err(PathError::EmptyComponent(raw.to_string()));
        }
        Ok(VfsPath(trimmed.to_string()))
    }

    /// Validate a single child name (no separators, non-empty).
    pub fn validate_name(name: &str) -> Result<(), PathError> {
        if name.is_empty() {
            return Err(PathError::EmptyComponent(name.to_string()));
        }
        if name.contains(SEPARATOR) {
            return Err(PathError::SeparatorInName(name.to_string()));
        }
        Ok(())
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw normalized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a child name. The name must already be a valid single
    /// component (see [`VfsPath::validate_name`]).
    pub fn join(&self, name: &str) -> VfsPath {
        debug_assert!(VfsPath::validate_name(name).is_ok());
        if self.is_root() {
            VfsPath(name.to_string())
        } else {
            VfsPath(format!("{}{}{}", self.0, SEPARATOR, name))
        }
    }

    /// Append a multi-component relative suffix (already normalized).
    pub fn join_all(&self, suffix: &str) -> VfsPath {
        let mut out = self.clone();
        for comp in suffix.split(SEPARATOR).filter(|c| !c.is_empty()) {
            out = out.join(comp);
        }
        out
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<VfsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(idx) => Some(VfsPath(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Last component: name plus extension, or `""` for the root.
    pub fn name_ext(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Base name of the last component (before the last `.`).
    pub fn name(&self) -> &str {
        let ne = self.name_ext();
        match ne.rfind(EXT_SEPARATOR) {
            Some(idx) if idx > 0 => &ne[..idx],
            _ => ne,
        }
    }

    /// Extension of the last component (after the last `.`), or `""`.
    pub fn ext(&self) -> &str {
        let ne = self.name_ext();
        match ne.rfind(EXT_SEPARATOR) {
            Some(idx) if idx > 0 => &ne[idx + 1..],
            _ => "",
        }
    }

    /// Iterate components, root yielding none.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|c| !c.is_empty())
    }

    /// Number of components (depth); root is 0.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// True if `self` equals `ancestor` or lives underneath it.
    pub fn starts_with(&self, ancestor: &VfsPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&(SEPARATOR as u8)))
    }

    /// Replace the last component, keeping the parent.
    pub fn with_name_ext(&self, name_ext: &str) -> VfsPath {
        match self.parent() {
            Some(parent) => parent.join(name_ext),
            None => VfsPath(name_ext.to_string()),
        }
    }
}

/// Compose a `name.ext` component, omitting the dot for an empty extension.
pub fn compose_name_ext(name: &str, ext: &str) -> String {
    if ext.is_empty() {
        name.to_string()
    } else {
        format!("{name}{EXT_SEPARATOR}{ext}")
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<VfsPath> for String {
    fn from(p: VfsPath) -> String {
        p.0
    }
}

impl AsRef<str> for VfsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_slashes() {
        assert_eq!(VfsPath::parse("/a/b/").unwrap().as_str(), "a/b");
        assert_eq!(VfsPath::parse("a/b").unwrap().as_str(), "a/b");
        assert!(VfsPath::parse("").unwrap().is_root());
        assert!(VfsPath::parse("/").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_empty_components() {
        assert_eq!(
            VfsPath::parse("a//b"),
            Err(PathError::EmptyComponent("a//b".to_string()))
        );
    }

    #[test]
    fn test_join_and_parent() {
        let root = VfsPath::root();
        let pkg = root.join("pkg");
        let file = pkg.join("x.txt");
        assert_eq!(file.as_str(), "pkg/x.txt");
        assert_eq!(file.parent().unwrap(), pkg);
        assert_eq!(pkg.parent().unwrap(), root);
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn test_name_and_ext() {
        let p = VfsPath::parse("pkg/archive.tar.gz").unwrap();
        assert_eq!(p.name_ext(), "archive.tar.gz");
        assert_eq!(p.name(), "archive.tar");
        assert_eq!(p.ext(), "gz");

        let noext = VfsPath::parse("pkg/Makefile").unwrap();
        assert_eq!(noext.name(), "Makefile");
        assert_eq!(noext.ext(), "");

        // A leading dot is part of the name, not an extension.
        let dotfile = VfsPath::parse(".hidden").unwrap();
        assert_eq!(dotfile.name(), ".hidden");
        assert_eq!(dotfile.ext(), "");
    }

    #[test]
    fn test_join_all() {
        let base = VfsPath::parse("dst").unwrap();
        assert_eq!(base.join_all("a/b/c.txt").as_str(), "dst/a/b/c.txt");
        assert_eq!(base.join_all("").as_str(), "dst");
    }

    #[test]
    fn test_starts_with() {
        let pkg = VfsPath::parse("pkg").unwrap();
        let file = VfsPath::parse("pkg/x.txt").unwrap();
        let other = VfsPath::parse("pkgx/x.txt").unwrap();
        assert!(file.starts_with(&pkg));
        assert!(file.starts_with(&VfsPath::root()));
        assert!(pkg.starts_with(&pkg));
        assert!(!other.starts_with(&pkg));
    }

    #[test]
    fn test_validate_name() {
        assert!(VfsPath::validate_name("ok.txt").is_ok());
        assert!(VfsPath::validate_name("a/b").is_err());
        assert!(VfsPath::validate_name("").is_err());
    }

    #[test]
    fn test_compose_name_ext() {
        assert_eq!(compose_name_ext("x", "txt"), "x.txt");
        assert_eq!(compose_name_ext("folder", ""), "folder");
    }
}
