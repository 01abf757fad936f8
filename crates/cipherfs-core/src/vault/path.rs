//! Type-safe path handling for vault operations.
//!
//! Two distinct types prevent confusion between internal directory
//! identifiers (`DirId`, opaque UUIDs stored in pointer files) and
//! user-facing cleartext paths (`VaultPath`).

use relative_path::{RelativePath, RelativePathBuf};
use std::fmt;

/// Opaque directory identifier.
///
/// Directory ids are UUIDs stored inside directory-pointer files. They serve
/// as associated data for filename encryption, binding names to their parent
/// directory. The root directory has the empty id by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirId(String);

impl DirId {
    /// The root directory (empty string id).
    #[inline]
    pub fn root() -> Self {
        DirId(String::new())
    }

    /// Create a `DirId` from raw contents of a pointer file.
    #[inline]
    pub fn from_raw(id: impl Into<String>) -> Self {
        DirId(id.into())
    }

    /// Generate a fresh random v4 UUID id.
    pub fn generate() -> Self {
        DirId(uuid::Uuid::new_v4().to_string())
    }

    /// Check if this is the root directory.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the raw string representation.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DirId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// User-facing cleartext path within a vault.
///
/// Vault paths use `/` as separator regardless of host OS and are always
/// relative to the vault root; a leading slash is stripped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultPath(RelativePathBuf);

impl VaultPath {
    /// The root path (empty).
    #[inline]
    pub fn root() -> Self {
        VaultPath(RelativePathBuf::new())
    }

    /// Create a new vault path from a string, normalizing it.
    pub fn new(path: impl AsRef<str>) -> Self {
        let s = path.as_ref().trim_start_matches('/');
        VaultPath(RelativePath::new(s).normalize())
    }

    /// Check if this is the root path.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty() || self.0.as_str() == "."
    }

    /// Get the string representation of this path.
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Join this path with another component.
    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VaultPath(self.0.join(component.as_ref()))
    }

    /// Get the parent path; `None` for the root.
    pub fn parent(&self) -> Option<VaultPath> {
        if self.is_root() {
            return None;
        }
        Some(
            self.0
                .parent()
                .map(|p| VaultPath(p.to_relative_path_buf()))
                .unwrap_or_else(VaultPath::root),
        )
    }

    /// Get the final component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.file_name()
        }
    }

    /// Iterate over the components of this path.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Split into parent path and final component; `None` for the root.
    pub fn split(&self) -> Option<(VaultPath, &str)> {
        let parent = self.parent()?;
        let name = self.file_name()?;
        Some((parent, name))
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &VaultPath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0.starts_with(&other.0)
    }
}

impl AsRef<str> for VaultPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "/{}", self.0)
        }
    }
}

impl From<&str> for VaultPath {
    fn from(s: &str) -> Self {
        VaultPath::new(s)
    }
}

impl From<String> for VaultPath {
    fn from(s: String) -> Self {
        VaultPath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_id_root() {
        let root = DirId::root();
        assert!(root.is_root());
        assert_eq!(root.as_str(), "");
        assert_eq!(root.to_string(), "<root>");
    }

    #[test]
    fn test_dir_id_generate_is_uuid() {
        let id = DirId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert_ne!(id, DirId::generate());
    }

    #[test]
    fn test_vault_path_normalization() {
        let p1 = VaultPath::new("/Documents/file.txt");
        let p2 = VaultPath::new("Documents/file.txt");
        assert_eq!(p1, p2);
        assert_eq!(p1.as_str(), "Documents/file.txt");
    }

    #[test]
    fn test_vault_path_parent_chain() {
        let path = VaultPath::new("a/b/c");
        let b = path.parent().unwrap();
        assert_eq!(b.as_str(), "a/b");
        let a = b.parent().unwrap();
        assert_eq!(a.as_str(), "a");
        let root = a.parent().unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_vault_path_split() {
        let path = VaultPath::new("Documents/report.txt");
        let (parent, name) = path.split().unwrap();
        assert_eq!(parent.as_str(), "Documents");
        assert_eq!(name, "report.txt");

        assert!(VaultPath::root().split().is_none());
    }

    #[test]
    fn test_vault_path_starts_with() {
        let deep = VaultPath::new("a/b/c");
        assert!(deep.starts_with(&VaultPath::new("a/b")));
        assert!(deep.starts_with(&VaultPath::new("a/b/c")));
        assert!(deep.starts_with(&VaultPath::root()));
        assert!(!deep.starts_with(&VaultPath::new("a/bc")));
        assert!(!VaultPath::new("a").starts_with(&deep));
    }

    #[test]
    fn test_vault_path_display() {
        assert_eq!(VaultPath::root().to_string(), "/");
        assert_eq!(VaultPath::new("x/y").to_string(), "/x/y");
    }
}
