//! Common types used throughout Stowage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A logical path within a disk, independent of the underlying backend.
///
/// Always relative and forward-slash separated. The empty path is the root
/// of the disk. Drivers translate it into their native form (filesystem
/// path, object key, remote path, Drive folder walk).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath {
    components: Vec<String>,
}

impl StoragePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator or
    ///   is a relative segment (`.` / `..`)
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string.
    ///
    /// Leading, trailing and repeated slashes are dropped, so `"/a//b/"`
    /// and `"a/b"` are the same path.
    pub fn parse(path: &str) -> crate::Result<Self> {
        if path.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "Path cannot contain backslashes: {}",
                path
            )));
        }
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Extension of the last component, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.name()?;
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// Join this path with a single child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Append every component of `other` to this path.
    pub fn join_path(&self, other: &StoragePath) -> Self {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Remove `prefix` from the front of this path.
    ///
    /// Returns `None` when `prefix` is not an ancestor (or equal).
    pub fn strip_prefix(&self, prefix: &StoragePath) -> Option<Self> {
        if self.components.len() < prefix.components.len() {
            return None;
        }
        if self.components[..prefix.components.len()] != prefix.components[..] {
            return None;
        }
        Some(Self {
            components: self.components[prefix.components.len()..].to_vec(),
        })
    }

    /// True when `self` is `other` or lies below it.
    pub fn starts_with(&self, other: &StoragePath) -> bool {
        self.strip_prefix(other).is_some()
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Relative, slash-joined form (`""` for root).
    pub fn as_str(&self) -> String {
        self.components.join("/")
    }

    /// Absolute form with a leading slash (`"/"` for root).
    pub fn to_absolute(&self) -> String {
        format!("/{}", self.as_str())
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Relative path segment not allowed: {}",
            comp
        )));
    }
    Ok(())
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StoragePath {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StoragePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<StoragePath> for String {
    fn from(path: StoragePath) -> Self {
        path.as_str()
    }
}

/// Access level of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    /// POSIX mode bits used to simulate this visibility on filesystems.
    pub fn file_mode(self) -> u32 {
        match self {
            Visibility::Public => 0o644,
            Visibility::Private => 0o600,
        }
    }

    /// Map permission bits back to a visibility.
    ///
    /// Anything other than exactly 0644 reads as private.
    pub fn from_file_mode(mode: u32) -> Self {
        if mode & 0o777 == 0o644 {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown visibility: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_root() {
        let path = StoragePath::root();
        assert!(path.is_root());
        assert_eq!(path.as_str(), "");
        assert_eq!(path.to_absolute(), "/");
        assert_eq!(StoragePath::parse("/").unwrap(), path);
    }

    #[test]
    fn test_storage_path_parse_normalizes() {
        let path = StoragePath::parse("//foo/bar//baz/").unwrap();
        assert_eq!(path.components(), &["foo", "bar", "baz"]);
        assert_eq!(path.as_str(), "foo/bar/baz");
    }

    #[test]
    fn test_storage_path_rejects_traversal() {
        assert!(StoragePath::parse("a/../b").is_err());
        assert!(StoragePath::parse("./a").is_err());
        assert!(StoragePath::parse("a\\b").is_err());
    }

    #[test]
    fn test_storage_path_join_and_parent() {
        let path = StoragePath::root().join("foo").unwrap().join("bar.txt").unwrap();
        assert_eq!(path.as_str(), "foo/bar.txt");
        assert_eq!(path.parent().unwrap().as_str(), "foo");
        assert_eq!(path.name(), Some("bar.txt"));
        assert_eq!(path.extension(), Some("txt"));
        assert!(path.join("a/b").is_err());
    }

    #[test]
    fn test_storage_path_prefix_ops() {
        let prefix = StoragePath::parse("x/y").unwrap();
        let path = prefix.join_path(&StoragePath::parse("a.txt").unwrap());
        assert_eq!(path.as_str(), "x/y/a.txt");
        assert_eq!(path.strip_prefix(&prefix).unwrap().as_str(), "a.txt");
        assert!(path.starts_with(&prefix));
        assert!(StoragePath::parse("x/yz").unwrap().strip_prefix(&prefix).is_none());
    }

    #[test]
    fn test_hidden_file_has_no_extension() {
        let path = StoragePath::parse(".env").unwrap();
        assert_eq!(path.extension(), None);
    }

    #[test]
    fn test_storage_path_serde() {
        let path: StoragePath = serde_json::from_str("\"/a/b\"").unwrap();
        assert_eq!(path.as_str(), "a/b");
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"a/b\"");
    }

    #[test]
    fn test_visibility_modes() {
        assert_eq!(Visibility::from_file_mode(0o100644), Visibility::Public);
        assert_eq!(Visibility::from_file_mode(0o600), Visibility::Private);
        assert_eq!(Visibility::from_file_mode(0o755), Visibility::Private);
        assert_eq!("PUBLIC".parse::<Visibility>().unwrap(), Visibility::Public);
        assert!("shared".parse::<Visibility>().is_err());
    }
}
