//! Event handlers keeping file records consistent with the filesystem.
//!
//! # Overview
//!
//! Per identity, a record moves through
//! `Absent -> Present({p}) <-> Present({p, p2, ...}) -> Absent`:
//!
//! - **Upsert** stats the path. A known identity whose size and mtime are
//!   unchanged only gets the path merged in. Zero-byte files get the empty
//!   digest. Anything else is compared against every stored record of the
//!   same size.
//! - **Remove** strips the path, deleting the record with its last path, and
//!   only then signals in-flight comparisons. Stripping one of several names
//!   signals nothing: the identity is still live and open handles stay
//!   readable. An unknown path is a no-op.
//! - **Rename** substitutes the path in place so hash and size survive. A
//!   record found under neither path is an error the queue redelivers.
//!
//! Comparison results for existing records are written only after those
//! records are re-read: a record deleted meanwhile is never recreated, and
//! one whose size changed is left for its own upsert.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::cancel::{CancelKey, CancellationRegistry};
use super::{ChangeEvent, EventHandler};
use crate::duplicates::{CompareMember, Comparator, Verdict};
use crate::hasher::{Hash, EMPTY_DIGEST};
use crate::scanner::{FileId, FileStat};
use crate::shares::ShareMap;
use crate::store::{
    delete_with_retries, save_all_with_retries, save_with_retries, FileRecord,
    MetadataRepository, RetryPolicy, StoreError,
};

/// Why an event changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The path no longer exists
    Vanished,
    /// The path is not a regular file
    NotAFile,
    /// The path could not be stat'ed
    Unreadable,
    /// The file was removed while being compared
    RemovedDuringComparison,
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Nothing was written
    Skipped {
        /// Path the event named
        path: PathBuf,
        /// Why
        reason: SkipReason,
    },
    /// The record was written
    Stored {
        /// Record identity
        id: FileId,
        /// Hash it was stored with
        hash: Option<Hash>,
        /// Other records whose hash changed as a result
        updated: usize,
    },
    /// A path was removed
    Removed {
        /// Record identity
        id: FileId,
        /// Whether the whole record was deleted
        deleted: bool,
    },
    /// Remove of a path no record owns
    NotFound {
        /// Path the event named
        path: PathBuf,
    },
    /// A path was substituted in place
    Renamed {
        /// Record identity
        id: FileId,
    },
    /// The store write was given up after retries
    Abandoned {
        /// Record identity
        id: FileId,
    },
}

/// Errors that ask for the event to be delivered again.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A rename's record is owned by neither its old nor its new path.
    #[error("no record for rename {from} -> {to}")]
    RecordNotFound {
        /// Old path
        from: PathBuf,
        /// New path
        to: PathBuf,
    },

    /// Reading from the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Whether redelivering the event may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RecordNotFound { .. } | Self::Store(_) => true,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Share resolution for record paths
    pub shares: ShareMap,
    /// Retry policy for store writes
    pub retry: RetryPolicy,
}

/// Handles change events against a metadata store.
pub struct EventPipeline {
    repo: Arc<dyn MetadataRepository>,
    comparator: Arc<Comparator>,
    cancellation: Arc<CancellationRegistry>,
    config: PipelineConfig,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("comparator", &self.comparator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    /// Create a pipeline.
    ///
    /// `cancellation` must be the registry the comparator subscribes to for
    /// removals to reach in-flight sessions.
    #[must_use]
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        comparator: Arc<Comparator>,
        cancellation: Arc<CancellationRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            comparator,
            cancellation,
            config,
        }
    }

    /// Handle a created or modified file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store cannot be read.
    pub fn upsert(&self, path: &Path) -> Result<EventOutcome, PipelineError> {
        let stat = match FileStat::from_path(path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Upsert of vanished path {}", path.display());
                return Ok(skipped(path, SkipReason::Vanished));
            }
            Err(e) => {
                log::warn!("Cannot stat {}: {}", path.display(), e);
                return Ok(skipped(path, SkipReason::Unreadable));
            }
        };
        if !stat.is_file {
            return Ok(skipped(path, SkipReason::NotAFile));
        }

        let shares = &self.config.shares;
        let mut record = match self.repo.get(stat.id)? {
            Some(mut existing) => {
                let content_changed = existing.apply_stat(&stat);
                existing.add_path(path.to_path_buf(), shares);
                if !content_changed {
                    log::debug!("{} gained name {}, unchanged", existing.id, path.display());
                    return Ok(self.store(existing, Vec::new()));
                }
                existing.hash = None;
                existing
            }
            None => FileRecord::from_stat(path.to_path_buf(), &stat, shares),
        };

        if stat.size == 0 {
            record.hash = Some(EMPTY_DIGEST);
            return Ok(self.store(record, Vec::new()));
        }

        let candidates: Vec<FileRecord> = self
            .repo
            .find_by_size(stat.size)?
            .into_iter()
            .filter(|c| c.id != record.id)
            .collect();
        if candidates.is_empty() {
            log::debug!("{} is unique by size", path.display());
            return Ok(self.store(record, Vec::new()));
        }

        let mut members = vec![CompareMember::new(record.id, path.to_path_buf())];
        members.extend(
            candidates
                .iter()
                .filter_map(|c| Some(CompareMember::new(c.id, c.primary_path()?.to_path_buf()))),
        );
        log::debug!(
            "Comparing {} against {} candidates of {} bytes",
            path.display(),
            candidates.len(),
            stat.size
        );
        let outcome = self.comparator.compare(stat.size, members);

        match outcome.verdict(record.id) {
            Some(Verdict::Confirmed(hash)) => record.hash = Some(hash),
            Some(Verdict::Cancelled) => {
                return Ok(skipped(path, SkipReason::RemovedDuringComparison));
            }
            Some(Verdict::Unique | Verdict::Failed) | None => record.hash = None,
        }

        let mut updates = Vec::new();
        for candidate in &candidates {
            let desired = match outcome.verdict(candidate.id) {
                Some(Verdict::Confirmed(hash)) => Some(hash),
                Some(Verdict::Unique) => None,
                Some(Verdict::Failed | Verdict::Cancelled) | None => continue,
            };
            let Some(mut current) = self.repo.get(candidate.id)? else {
                log::debug!("{} was deleted during comparison", candidate.id);
                continue;
            };
            if current.size != candidate.size || current.hash == desired {
                continue;
            }
            current.hash = desired;
            updates.push(current);
        }

        Ok(self.store(record, updates))
    }

    /// Handle a removed file name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store cannot be read.
    pub fn remove(&self, path: &Path) -> Result<EventOutcome, PipelineError> {
        let Some(mut record) = self.repo.find_by_path(path)? else {
            // May still be under comparison as a not yet stored upsert.
            self.cancellation
                .publish(CancelKey::Path(path.to_path_buf()));
            log::warn!("Remove of untracked path {}", path.display());
            return Ok(EventOutcome::NotFound {
                path: path.to_path_buf(),
            });
        };
        let id = record.id;

        if record.paths.len() <= 1 {
            self.cancellation
                .publish(CancelKey::Path(path.to_path_buf()));
            self.cancellation.publish(CancelKey::File(id));
            if !delete_with_retries(self.repo.as_ref(), id, &self.config.retry) {
                return Ok(EventOutcome::Abandoned { id });
            }
            log::debug!("Deleted {} with its last path {}", id, path.display());
            return Ok(EventOutcome::Removed { id, deleted: true });
        }

        record.remove_path(path, &self.config.shares);
        if !save_with_retries(self.repo.as_ref(), &record, &self.config.retry) {
            return Ok(EventOutcome::Abandoned { id });
        }
        log::debug!("Stripped {} from {}", path.display(), id);
        Ok(EventOutcome::Removed { id, deleted: false })
    }

    /// Handle a renamed file name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RecordNotFound`] if neither path leads to a
    /// record, or [`PipelineError::Store`] if the store cannot be read.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<EventOutcome, PipelineError> {
        let record = match self.repo.find_by_path(from)? {
            Some(record) => Some(record),
            None => match FileStat::from_path(to) {
                Ok(stat) => self.repo.get(stat.id)?,
                Err(e) => {
                    log::debug!("Cannot stat rename target {}: {}", to.display(), e);
                    None
                }
            },
        };
        let Some(mut record) = record else {
            return Err(PipelineError::RecordNotFound {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            });
        };

        let id = record.id;
        record.rename_path(from, to.to_path_buf(), &self.config.shares);
        if !save_with_retries(self.repo.as_ref(), &record, &self.config.retry) {
            return Ok(EventOutcome::Abandoned { id });
        }
        log::debug!("Renamed {} -> {} for {}", from.display(), to.display(), id);
        Ok(EventOutcome::Renamed { id })
    }

    fn store(&self, record: FileRecord, updates: Vec<FileRecord>) -> EventOutcome {
        let id = record.id;
        let hash = record.hash;
        let updated = updates.len();
        let mut batch = updates;
        batch.push(record);
        if save_all_with_retries(self.repo.as_ref(), &batch, &self.config.retry) {
            EventOutcome::Stored { id, hash, updated }
        } else {
            EventOutcome::Abandoned { id }
        }
    }
}

impl EventHandler for EventPipeline {
    fn handle(&self, event: &ChangeEvent) -> Result<EventOutcome, PipelineError> {
        match event {
            ChangeEvent::Upsert { path } => self.upsert(path),
            ChangeEvent::Remove { path } => self.remove(path),
            ChangeEvent::Rename { from, to } => self.rename(from, to),
        }
    }
}

fn skipped(path: &Path, reason: SkipReason) -> EventOutcome {
    EventOutcome::Skipped {
        path: path.to_path_buf(),
        reason,
    }
}
