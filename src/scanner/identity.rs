//! File identity and stat snapshots.
//!
//! # Overview
//!
//! A file's identity is its inode number: every hardlink to the same content
//! shares it, and it survives renames. [`FileStat`] captures everything the
//! scanner and the event pipeline need from one `stat` call.
//!
//! # Platform Support
//!
//! - **Unix**: identity and timestamps come from `MetadataExt`
//! - **Other**: stat fails with [`std::io::ErrorKind::Unsupported`]

use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};

/// Stable per-file identity (inode number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ino {}", self.0)
    }
}

/// Snapshot of the attributes of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Inode identity
    pub id: FileId,
    /// Size in bytes
    pub size: u64,
    /// Hardlink count as reported by the filesystem
    pub nlink: u64,
    /// Last access time
    pub atime: DateTime<Utc>,
    /// Last content modification time
    pub mtime: DateTime<Utc>,
    /// Last status change time
    pub ctime: DateTime<Utc>,
    /// Whether this is a regular file
    pub is_file: bool,
}

impl FileStat {
    /// Stat a path, following symlinks.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the path cannot be stat'ed, or an
    /// `Unsupported` error on platforms without inode numbers.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }

    /// Build a snapshot from already-fetched metadata.
    ///
    /// # Errors
    ///
    /// Returns an `Unsupported` error on platforms without inode numbers.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        Ok(Self {
            id: FileId(metadata.ino()),
            size: metadata.size(),
            nlink: metadata.nlink(),
            atime: timestamp(metadata.atime(), metadata.atime_nsec()),
            mtime: timestamp(metadata.mtime(), metadata.mtime_nsec()),
            ctime: timestamp(metadata.ctime(), metadata.ctime_nsec()),
            is_file: metadata.is_file(),
        })
    }

    /// Build a snapshot from already-fetched metadata.
    ///
    /// # Errors
    ///
    /// Always fails: this platform exposes no inode numbers.
    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "file identity requires inode numbers",
        ))
    }
}

#[cfg(unix)]
fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    DateTime::from_timestamp(secs, nsecs).unwrap_or(DateTime::UNIX_EPOCH)
}
