//! Share resolution for absolute paths.
//!
//! A share is the top-level mount a path lives under. Shares are derived from
//! paths and never stored on their own.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Default directory whose immediate children are treated as shares.
pub const DEFAULT_SHARE_BASE: &str = "/mnt/user";

/// Mapping from share names to their root directories.
///
/// # Example
///
/// ```
/// use dupewatch::shares::ShareMap;
/// use std::path::Path;
///
/// let shares = ShareMap::default().with_share("photos", "/data/pictures");
/// assert_eq!(shares.share_of(Path::new("/data/pictures/a.jpg")).as_deref(), Some("photos"));
/// assert_eq!(shares.share_of(Path::new("/mnt/user/media/b.mkv")).as_deref(), Some("media"));
/// assert_eq!(shares.share_of(Path::new("/tmp/c")), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareMap {
    roots: BTreeMap<String, PathBuf>,
    base: Option<PathBuf>,
}

impl Default for ShareMap {
    fn default() -> Self {
        Self {
            roots: BTreeMap::new(),
            base: Some(PathBuf::from(DEFAULT_SHARE_BASE)),
        }
    }
}

impl ShareMap {
    /// Build a map from explicit `(name, root)` pairs and an optional base.
    #[must_use]
    pub fn new(roots: impl IntoIterator<Item = (String, PathBuf)>, base: Option<PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            base,
        }
    }

    /// Add or replace one configured share.
    #[must_use]
    pub fn with_share(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(name.into(), root.into());
        self
    }

    /// Set or clear the base directory.
    #[must_use]
    pub fn with_base(mut self, base: Option<PathBuf>) -> Self {
        self.base = base;
        self
    }

    /// Configured `(name, root)` pairs in name order.
    pub fn roots(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.roots.iter().map(|(n, r)| (n.as_str(), r.as_path()))
    }

    /// Whether no share root is configured explicitly.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Share a path belongs to.
    ///
    /// The longest configured root containing the path wins. Failing that, a
    /// path under the base directory belongs to the share named by its first
    /// component below the base.
    #[must_use]
    pub fn share_of(&self, path: &Path) -> Option<String> {
        let configured = self
            .roots
            .iter()
            .filter(|(_, root)| path.starts_with(root))
            .max_by_key(|(_, root)| root.components().count())
            .map(|(name, _)| name.clone());
        if configured.is_some() {
            return configured;
        }

        let base = self.base.as_ref()?;
        let rest = path.strip_prefix(base).ok()?;
        let mut components = rest.components();
        let first = components.next()?;
        // A bare "/mnt/user/x" with nothing below it is the share dir itself.
        components.next()?;
        match first {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_share_from_first_component() {
        let shares = ShareMap::default();
        assert_eq!(
            shares.share_of(Path::new("/mnt/user/media/movies/a.mkv")),
            Some("media".to_string())
        );
    }

    #[test]
    fn test_share_dir_itself_has_no_share() {
        let shares = ShareMap::default();
        assert_eq!(shares.share_of(Path::new("/mnt/user/media")), None);
        assert_eq!(shares.share_of(Path::new("/mnt/user")), None);
    }

    #[test]
    fn test_outside_base_has_no_share() {
        let shares = ShareMap::default();
        assert_eq!(shares.share_of(Path::new("/home/user/a.txt")), None);
    }

    #[test]
    fn test_longest_configured_root_wins() {
        let shares = ShareMap::default()
            .with_share("data", "/srv/data")
            .with_share("photos", "/srv/data/photos");

        assert_eq!(
            shares.share_of(Path::new("/srv/data/photos/a.jpg")),
            Some("photos".to_string())
        );
        assert_eq!(
            shares.share_of(Path::new("/srv/data/docs/b.pdf")),
            Some("data".to_string())
        );
    }

    #[test]
    fn test_configured_root_beats_base() {
        let shares = ShareMap::default().with_share("archive", "/mnt/user/media/old");
        assert_eq!(
            shares.share_of(Path::new("/mnt/user/media/old/x")),
            Some("archive".to_string())
        );
    }

    #[test]
    fn test_component_prefix_is_not_a_match() {
        let shares = ShareMap::new(
            vec![("data".to_string(), PathBuf::from("/srv/data"))],
            None,
        );
        assert_eq!(shares.share_of(Path::new("/srv/database/x")), None);
    }

    #[test]
    fn test_no_base() {
        let shares = ShareMap::default().with_base(None);
        assert_eq!(shares.share_of(Path::new("/mnt/user/media/a")), None);
        assert!(shares.is_empty());
    }
}
