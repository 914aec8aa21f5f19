//! Size bucketing of scanned files with hardlink merge.
//!
//! # Overview
//!
//! Size grouping is the first step of duplicate detection: files of
//! different sizes cannot be duplicates, so only buckets holding two or more
//! identities ever reach the comparator.
//!
//! Within a bucket, a file whose identity is already present is a hardlink:
//! its path is merged into the existing record instead of creating a second
//! member. Hardlinks are therefore never compared against each other.
//!
//! # Example
//!
//! ```
//! use dupewatch::duplicates::SizeBuckets;
//! use dupewatch::scanner::{FileId, FileStat, ScannedFile};
//! use dupewatch::shares::ShareMap;
//! use chrono::DateTime;
//! use std::path::PathBuf;
//!
//! let file = |path: &str, id: u64, size: u64| ScannedFile {
//!     path: PathBuf::from(path),
//!     stat: FileStat {
//!         id: FileId(id),
//!         size,
//!         nlink: 1,
//!         atime: DateTime::UNIX_EPOCH,
//!         mtime: DateTime::UNIX_EPOCH,
//!         ctime: DateTime::UNIX_EPOCH,
//!         is_file: true,
//!     },
//! };
//!
//! let mut buckets = SizeBuckets::new(ShareMap::default());
//! buckets.insert(file("/mnt/user/a/1", 1, 100));
//! buckets.insert(file("/mnt/user/a/2", 2, 100));
//! buckets.insert(file("/mnt/user/a/3", 3, 200));
//!
//! let scan = buckets.finish();
//! assert_eq!(scan.groups.len(), 1);
//! assert_eq!(scan.unique.len(), 1);
//! assert_eq!(scan.stats.eliminated_unique, 1);
//! ```

use std::collections::HashMap;

use crate::scanner::{FileId, ScannedFile};
use crate::shares::ShareMap;
use crate::store::FileRecord;

/// Records of one exact size, one per identity.
#[derive(Debug, Clone, Default)]
pub struct SizeGroup {
    /// Size in bytes shared by every member
    pub size: u64,
    /// Members, in discovery order
    pub records: Vec<FileRecord>,
    index: HashMap<FileId, usize>,
}

impl SizeGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self {
            size,
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a scanned file. Returns `true` if it merged into an existing
    /// member as another hardlink name.
    pub fn add(&mut self, file: ScannedFile, shares: &ShareMap) -> bool {
        debug_assert_eq!(
            file.stat.size, self.size,
            "File size {} doesn't match group size {}",
            file.stat.size, self.size
        );
        if let Some(&pos) = self.index.get(&file.stat.id) {
            return self.records[pos].add_path(file.path, shares);
        }
        self.index.insert(file.stat.id, self.records.len());
        self.records
            .push(FileRecord::from_stat(file.path, &file.stat, shares));
        false
    }

    /// Number of distinct identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if this group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the group needs content comparison (2+ identities).
    #[must_use]
    pub fn has_candidates(&self) -> bool {
        self.records.len() > 1
    }

    /// Potential space savings (all identities minus one).
    #[must_use]
    pub fn potential_savings(&self) -> u64 {
        self.size * (self.records.len() as u64).saturating_sub(1)
    }
}

/// Statistics from size bucketing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingStats {
    /// Paths inserted, hardlink names included
    pub total_files: usize,
    /// Total size of distinct identities in bytes
    pub total_size: u64,
    /// Paths merged into an existing identity
    pub hardlinks_merged: usize,
    /// Identities of zero bytes
    pub empty_files: usize,
    /// Number of distinct non-zero sizes
    pub unique_sizes: usize,
    /// Identities alone in their size bucket
    pub eliminated_unique: usize,
    /// Identities in buckets of 2+
    pub potential_duplicates: usize,
    /// Buckets of 2+ identities
    pub duplicate_groups: usize,
}

impl GroupingStats {
    /// Percentage of identities eliminated by size alone.
    #[must_use]
    pub fn elimination_rate(&self) -> f64 {
        let identities = self.eliminated_unique + self.potential_duplicates + self.empty_files;
        if identities == 0 {
            0.0
        } else {
            (self.eliminated_unique as f64 / identities as f64) * 100.0
        }
    }
}

/// Result of bucketing a whole scan.
#[derive(Debug, Default)]
pub struct BucketedScan {
    /// Zero-byte identities; trivially identical to each other
    pub empty: Vec<FileRecord>,
    /// Identities unique by size; persisted unhashed
    pub unique: Vec<FileRecord>,
    /// Buckets needing content comparison, largest size first
    pub groups: Vec<SizeGroup>,
    /// Counters
    pub stats: GroupingStats,
}

/// Accumulates scanned files into [`SizeGroup`]s.
#[derive(Debug)]
pub struct SizeBuckets {
    shares: ShareMap,
    groups: HashMap<u64, SizeGroup>,
    sizes: HashMap<FileId, u64>,
    stats: GroupingStats,
}

impl SizeBuckets {
    /// Create empty buckets deriving shares with `shares`.
    #[must_use]
    pub fn new(shares: ShareMap) -> Self {
        Self {
            shares,
            groups: HashMap::new(),
            sizes: HashMap::new(),
            stats: GroupingStats::default(),
        }
    }

    /// Add one scanned file.
    pub fn insert(&mut self, file: ScannedFile) {
        self.stats.total_files += 1;
        let size = file.stat.size;

        match self.sizes.get(&file.stat.id) {
            Some(&known) if known != size => {
                // Content changed between visiting two names of one identity.
                log::warn!(
                    "{} seen with sizes {} and {}; keeping the first, ignoring {}",
                    file.stat.id,
                    known,
                    size,
                    file.path.display()
                );
                return;
            }
            Some(_) => {}
            None => {
                self.sizes.insert(file.stat.id, size);
                self.stats.total_size += size;
            }
        }

        let group = self
            .groups
            .entry(size)
            .or_insert_with(|| SizeGroup::new(size));
        if group.add(file, &self.shares) {
            self.stats.hardlinks_merged += 1;
        }
    }

    /// Split buckets into empty files, size-unique files and comparison groups.
    #[must_use]
    pub fn finish(self) -> BucketedScan {
        let mut stats = self.stats;
        let mut scan = BucketedScan::default();

        for (size, group) in self.groups {
            if size == 0 {
                stats.empty_files += group.len();
                scan.empty.extend(group.records);
                continue;
            }
            stats.unique_sizes += 1;
            if group.has_candidates() {
                stats.potential_duplicates += group.len();
                stats.duplicate_groups += 1;
                log::debug!(
                    "Size group {} bytes: {} potential duplicates",
                    size,
                    group.len()
                );
                scan.groups.push(group);
            } else {
                stats.eliminated_unique += group.len();
                scan.unique.extend(group.records);
            }
        }

        scan.groups.sort_by(|a, b| b.size.cmp(&a.size));
        scan.unique.sort_by_key(|r| r.id);
        scan.empty.sort_by_key(|r| r.id);

        log::debug!(
            "Size bucketing: {} paths, {} hardlinks merged, {} unique sizes, {} groups to compare",
            stats.total_files,
            stats.hardlinks_merged,
            stats.unique_sizes,
            stats.duplicate_groups
        );

        scan.stats = stats;
        scan
    }
}
