//! Persisted per-identity file record.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::hasher::Hash;
use crate::scanner::{FileId, FileStat};
use crate::shares::ShareMap;

/// Everything known about one file identity.
///
/// `paths` holds every hardlink name of the identity in discovery order and
/// is never empty for a stored record. `shares[i]` is the share of
/// `paths[i]`; it is always recomputed from `paths`, never set directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Inode identity
    pub id: FileId,
    /// Hardlink names, first one is the primary path
    pub paths: Vec<PathBuf>,
    /// Size in bytes
    pub size: u64,
    /// Hardlink count last observed on disk
    pub nlink: u64,
    /// Last access time
    pub atime: DateTime<Utc>,
    /// Last content modification time
    pub mtime: DateTime<Utc>,
    /// Last status change time
    pub ctime: DateTime<Utc>,
    /// Confirmed whole-content digest
    pub hash: Option<Hash>,
    shares: Vec<Option<String>>,
}

impl FileRecord {
    /// New unhashed record with a single path.
    #[must_use]
    pub fn from_stat(path: PathBuf, stat: &FileStat, shares: &ShareMap) -> Self {
        let mut record = Self {
            id: stat.id,
            paths: vec![path],
            size: stat.size,
            nlink: stat.nlink,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            hash: None,
            shares: Vec::new(),
        };
        record.rebuild_shares(shares);
        record
    }

    /// Reassemble a record from stored columns.
    ///
    /// `paths` and `shares` must line up one to one.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub(crate) fn from_parts(
        id: FileId,
        paths: Vec<PathBuf>,
        shares: Vec<Option<String>>,
        size: u64,
        nlink: u64,
        times: [DateTime<Utc>; 3],
        hash: Option<Hash>,
    ) -> Self {
        let [atime, mtime, ctime] = times;
        Self {
            id,
            paths,
            size,
            nlink,
            atime,
            mtime,
            ctime,
            hash,
            shares,
        }
    }

    /// Derived share of each path, index-aligned with `paths`.
    #[must_use]
    pub fn shares(&self) -> &[Option<String>] {
        &self.shares
    }

    /// First path of the record; content reads go through it.
    #[must_use]
    pub fn primary_path(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }

    /// Whether `path` is one of this record's names.
    #[must_use]
    pub fn has_path(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// Add a hardlink name. Returns `false` if it was already present.
    pub fn add_path(&mut self, path: PathBuf, shares: &ShareMap) -> bool {
        if self.has_path(&path) {
            return false;
        }
        self.paths.push(path);
        self.rebuild_shares(shares);
        true
    }

    /// Strip a name. Returns `false` if it was not present.
    ///
    /// May leave `paths` empty; callers delete the record in that case.
    pub fn remove_path(&mut self, path: &Path, shares: &ShareMap) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| p != path);
        let removed = self.paths.len() != before;
        if removed {
            self.rebuild_shares(shares);
        }
        removed
    }

    /// Replace `from` with `to` in place, keeping its position.
    ///
    /// If `from` is not a name of this record, `to` is appended instead. A
    /// `to` that is already present is not duplicated.
    pub fn rename_path(&mut self, from: &Path, to: PathBuf, shares: &ShareMap) {
        if self.has_path(&to) {
            self.paths.retain(|p| p != from);
        } else if let Some(slot) = self.paths.iter_mut().find(|p| p.as_path() == from) {
            *slot = to;
        } else {
            self.paths.push(to);
        }
        self.rebuild_shares(shares);
    }

    /// Refresh attributes from a new stat of the same identity.
    ///
    /// Returns `true` when size or mtime changed, meaning any stored hash
    /// can no longer be trusted.
    pub fn apply_stat(&mut self, stat: &FileStat) -> bool {
        let content_changed = self.size != stat.size || self.mtime != stat.mtime;
        self.size = stat.size;
        self.nlink = stat.nlink;
        self.atime = stat.atime;
        self.mtime = stat.mtime;
        self.ctime = stat.ctime;
        content_changed
    }

    /// Recompute `shares` from `paths`.
    pub fn rebuild_shares(&mut self, shares: &ShareMap) {
        self.shares = self.paths.iter().map(|p| shares.share_of(p)).collect();
    }
}
