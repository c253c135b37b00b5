//! Hierarchical, slash-separated datastore keys.

use std::fmt;

/// A cleaned, slash-separated key such as `/peer/record`.
///
/// Keys always start with `/`, never end with one (except the root) and never
/// contain empty segments. Ordering is plain string ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Build a key from an arbitrary path, normalizing separators.
    pub fn new(path: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if segments.is_empty() {
            return Self::root();
        }
        Self(format!("/{}", segments.join("/")))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one segment. Separators inside `name` create further segments.
    pub fn child_string(&self, name: impl AsRef<str>) -> Self {
        Self::new(format!("{}/{}", self.0, name.as_ref()))
    }

    /// The key one level up. The root is its own parent.
    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0.split_at(idx).0.to_string()),
        }
    }

    /// Last segment of the key (empty for the root).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// True if `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Key) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.starts_with(ancestor.as_str())
            && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/')
    }

    /// Smallest string that every descendant starts with (`"/a/"` for `/a`).
    ///
    /// Descendants are contiguous in string order starting at this bound, so
    /// backends can range-scan from it.
    pub fn descendant_bound(&self) -> String {
        if self.is_root() {
            return self.0.clone();
        }
        format!("{}/", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}
