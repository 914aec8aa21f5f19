//! Metadata repository: durable file records keyed by identity.
//!
//! # Overview
//!
//! The [`MetadataRepository`] trait is the only shared mutable state in the
//! engine. Records are addressed by [`FileId`] and can be queried by size,
//! by path membership and by hash. [`SqliteRepository`] is the bundled
//! implementation.
//!
//! Writes are read-modify-write without a concurrency token; callers keep
//! writes for one identity ordered (see [`crate::events::queue`]).
//!
//! Persistence failures are retried a bounded number of times through the
//! `*_with_retries` helpers, which log and give up rather than fail the
//! caller.

pub mod database;
pub mod record;

use std::path::Path;
use std::time::Duration;

pub use database::SqliteRepository;
pub use record::FileRecord;

use crate::hasher::Hash;
use crate::scanner::FileId;

/// Errors from the metadata store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The underlying SQLite call failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record for {id}: {reason}")]
    Corrupt {
        /// Identity of the offending record
        id: FileId,
        /// What was wrong with it
        reason: String,
    },

    /// Attempted to store a record without any path.
    #[error("refusing to save {0} with no paths")]
    EmptyRecord(FileId),

    /// The database file's directory could not be created.
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created
        path: std::path::PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// A set of records sharing one confirmed content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSet {
    /// Shared content digest
    pub hash: Hash,
    /// Size of every member
    pub size: u64,
    /// Member records, ordered by identity
    pub records: Vec<FileRecord>,
    /// Identity designated as the copy to keep, if any
    pub keep: Option<FileId>,
}

impl DuplicateSet {
    /// Bytes reclaimable by keeping one identity.
    #[must_use]
    pub fn reclaimable_bytes(&self) -> u64 {
        self.size * (self.records.len() as u64).saturating_sub(1)
    }
}

/// Durable store of [`FileRecord`]s.
///
/// Every query is stateless: nothing is remembered between calls.
pub trait MetadataRepository: Send + Sync {
    /// Fetch a record by identity.
    fn get(&self, id: FileId) -> Result<Option<FileRecord>, StoreError>;

    /// Every record of exactly `size` bytes.
    fn find_by_size(&self, size: u64) -> Result<Vec<FileRecord>, StoreError>;

    /// The record owning `path`, if any.
    fn find_by_path(&self, path: &Path) -> Result<Option<FileRecord>, StoreError>;

    /// Insert or fully replace a record.
    ///
    /// Paths claimed by another record move to this one; a record left
    /// without paths by the move is deleted.
    fn save(&self, record: &FileRecord) -> Result<(), StoreError>;

    /// Save several records as one unit.
    fn save_all(&self, records: &[FileRecord]) -> Result<(), StoreError> {
        records.iter().try_for_each(|r| self.save(r))
    }

    /// Delete a record. Returns whether it existed.
    fn delete(&self, id: FileId) -> Result<bool, StoreError>;

    /// Records with more than one path (hardlinked files).
    fn find_with_multiple_paths(&self) -> Result<Vec<FileRecord>, StoreError>;

    /// Hashes shared by two or more records, with their members.
    fn find_duplicate_sets(&self) -> Result<Vec<DuplicateSet>, StoreError>;

    /// Record which identity of a duplicate set is to be kept.
    fn designate_keep(&self, hash: &Hash, id: FileId) -> Result<(), StoreError>;

    /// Number of stored records.
    fn count(&self) -> Result<usize, StoreError>;
}

/// Bounded retry with fixed backoff for store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy with no pause between attempts.
    #[must_use]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Duration::ZERO,
        }
    }
}

fn with_retries<F>(policy: &RetryPolicy, what: &str, mut op: F) -> bool
where
    F: FnMut() -> Result<(), StoreError>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match op() {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Failed to {} (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    attempts,
                    e,
                    policy.backoff
                );
                std::thread::sleep(policy.backoff);
            }
            Err(e) => {
                log::error!(
                    "Giving up on {} after {} attempts: {}",
                    what,
                    attempts,
                    e
                );
            }
        }
    }
    false
}

/// Save one record, retrying per `policy`. Returns whether it landed.
pub fn save_with_retries(
    repo: &dyn MetadataRepository,
    record: &FileRecord,
    policy: &RetryPolicy,
) -> bool {
    with_retries(policy, &format!("save {}", record.id), || repo.save(record))
}

/// Save several records as one unit, retrying per `policy`.
pub fn save_all_with_retries(
    repo: &dyn MetadataRepository,
    records: &[FileRecord],
    policy: &RetryPolicy,
) -> bool {
    if records.is_empty() {
        return true;
    }
    with_retries(policy, &format!("save {} records", records.len()), || {
        repo.save_all(records)
    })
}

/// Delete one record, retrying per `policy`. Returns whether it landed.
pub fn delete_with_retries(repo: &dyn MetadataRepository, id: FileId, policy: &RetryPolicy) -> bool {
    with_retries(policy, &format!("delete {}", id), || {
        repo.delete(id).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::FileStat;
    use crate::shares::ShareMap;
    use chrono::DateTime;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Repository whose writes fail a fixed number of times first.
    struct FlakyRepository {
        inner: SqliteRepository,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyRepository {
        fn new(failures: u32) -> Self {
            Self {
                inner: SqliteRepository::open_in_memory().unwrap(),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn maybe_fail(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            Ok(())
        }
    }

    impl MetadataRepository for FlakyRepository {
        fn get(&self, id: FileId) -> Result<Option<FileRecord>, StoreError> {
            self.inner.get(id)
        }
        fn find_by_size(&self, size: u64) -> Result<Vec<FileRecord>, StoreError> {
            self.inner.find_by_size(size)
        }
        fn find_by_path(&self, path: &Path) -> Result<Option<FileRecord>, StoreError> {
            self.inner.find_by_path(path)
        }
        fn save(&self, record: &FileRecord) -> Result<(), StoreError> {
            self.maybe_fail()?;
            self.inner.save(record)
        }
        fn delete(&self, id: FileId) -> Result<bool, StoreError> {
            self.maybe_fail()?;
            self.inner.delete(id)
        }
        fn find_with_multiple_paths(&self) -> Result<Vec<FileRecord>, StoreError> {
            self.inner.find_with_multiple_paths()
        }
        fn find_duplicate_sets(&self) -> Result<Vec<DuplicateSet>, StoreError> {
            self.inner.find_duplicate_sets()
        }
        fn designate_keep(&self, hash: &Hash, id: FileId) -> Result<(), StoreError> {
            self.inner.designate_keep(hash, id)
        }
        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
    }

    fn record(id: u64) -> FileRecord {
        let stat = FileStat {
            id: FileId(id),
            size: 4,
            nlink: 1,
            atime: DateTime::UNIX_EPOCH,
            mtime: DateTime::UNIX_EPOCH,
            ctime: DateTime::UNIX_EPOCH,
            is_file: true,
        };
        FileRecord::from_stat(
            PathBuf::from(format!("/mnt/user/a/{id}")),
            &stat,
            &ShareMap::default(),
        )
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_save_succeeds_after_transient_failures() {
        let repo = FlakyRepository::new(2);
        assert!(save_with_retries(&repo, &record(1), &RetryPolicy::immediate(3)));
        assert_eq!(repo.calls.load(Ordering::SeqCst), 3);
        assert!(repo.get(FileId(1)).unwrap().is_some());
    }

    #[test]
    fn test_save_gives_up_after_exhaustion() {
        let repo = FlakyRepository::new(5);
        assert!(!save_with_retries(&repo, &record(1), &RetryPolicy::immediate(3)));
        assert_eq!(repo.calls.load(Ordering::SeqCst), 3);
        assert!(repo.get(FileId(1)).unwrap().is_none());
    }

    #[test]
    fn test_save_all_uses_default_loop() {
        let repo = FlakyRepository::new(0);
        assert!(save_all_with_retries(
            &repo,
            &[record(1), record(2)],
            &RetryPolicy::immediate(1)
        ));
        assert_eq!(repo.count().unwrap(), 2);
        assert!(save_all_with_retries(&repo, &[], &RetryPolicy::immediate(1)));
    }

    #[test]
    fn test_delete_with_retries() {
        let repo = FlakyRepository::new(0);
        repo.save(&record(1)).unwrap();
        repo.failures_left.store(1, Ordering::SeqCst);
        assert!(delete_with_retries(&repo, FileId(1), &RetryPolicy::immediate(2)));
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn test_reclaimable_bytes() {
        let set = DuplicateSet {
            hash: [0; 32],
            size: 100,
            records: vec![record(1), record(2), record(3)],
            keep: None,
        };
        assert_eq!(set.reclaimable_bytes(), 200);
    }
}
