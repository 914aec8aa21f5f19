//! JSON export of confirmed duplicate groups.
//!
//! Every call reads the repository afresh; nothing is cached between calls.
//!
//! ```json
//! {
//!   "groups": [
//!     {
//!       "hash": "af1349b9...",
//!       "size": 1024,
//!       "files": [
//!         {
//!           "path": "/mnt/user/media/a.mkv",
//!           "size": 1024,
//!           "atime": "2024-05-01T10:00:00Z",
//!           "mtime": "2024-05-01T10:00:00Z",
//!           "ctime": "2024-05-01T10:00:00Z",
//!           "keep": true
//!         }
//!       ]
//!     }
//!   ],
//!   "total_groups": 1,
//!   "total_files": 2,
//!   "reclaimable_bytes": 1024
//! }
//! ```

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hasher::hash_to_hex;
use crate::store::{DuplicateSet, MetadataRepository, StoreError};

/// One path of a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFile {
    /// Absolute path
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last access time
    pub atime: DateTime<Utc>,
    /// Last modification time
    pub mtime: DateTime<Utc>,
    /// Last status change time
    pub ctime: DateTime<Utc>,
    /// Whether this path's identity is the designated keeper
    pub keep: bool,
}

/// One duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportGroup {
    /// Content digest, lowercase hex
    pub hash: String,
    /// Size of every member
    pub size: u64,
    /// Every path of every member identity
    pub files: Vec<ExportFile>,
}

impl ExportGroup {
    fn from_set(set: &DuplicateSet) -> Self {
        let files = set
            .records
            .iter()
            .flat_map(|record| {
                let keep = set.keep == Some(record.id);
                record.paths.iter().map(move |path| ExportFile {
                    path: path.to_string_lossy().into_owned(),
                    size: record.size,
                    atime: record.atime,
                    mtime: record.mtime,
                    ctime: record.ctime,
                    keep,
                })
            })
            .collect();
        Self {
            hash: hash_to_hex(&set.hash),
            size: set.size,
            files,
        }
    }
}

/// Complete export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupExport {
    /// Confirmed duplicate groups
    pub groups: Vec<ExportGroup>,
    /// Number of groups
    pub total_groups: usize,
    /// Number of paths across all groups
    pub total_files: usize,
    /// Bytes freed by keeping one identity per group
    pub reclaimable_bytes: u64,
}

impl GroupExport {
    /// Build the document from duplicate sets.
    #[must_use]
    pub fn from_sets(sets: &[DuplicateSet]) -> Self {
        let groups: Vec<ExportGroup> = sets.iter().map(ExportGroup::from_set).collect();
        Self {
            total_groups: groups.len(),
            total_files: groups.iter().map(|g| g.files.len()).sum(),
            reclaimable_bytes: sets.iter().map(DuplicateSet::reclaimable_bytes).sum(),
            groups,
        }
    }

    /// Compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Indented JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the document followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns [`JsonOutputError`] if serialization or writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W, pretty: bool) -> Result<(), JsonOutputError> {
        if pretty {
            serde_json::to_writer_pretty(&mut *writer, self)?;
        } else {
            serde_json::to_writer(&mut *writer, self)?;
        }
        writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Read every confirmed duplicate set from the repository and export it.
///
/// # Errors
///
/// Returns [`StoreError`] if the repository cannot be read.
pub fn export_groups(repo: &dyn MetadataRepository) -> Result<GroupExport, StoreError> {
    let sets = repo.find_duplicate_sets()?;
    log::debug!("Exporting {} duplicate groups", sets.len());
    Ok(GroupExport::from_sets(&sets))
}

/// Errors writing JSON output.
#[derive(thiserror::Error, Debug)]
pub enum JsonOutputError {
    /// Serialization failed
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Writing failed
    #[error("I/O error writing JSON: {0}")]
    Io(#[from] std::io::Error),
}
