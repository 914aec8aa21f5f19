//! Share scan orchestration.
//!
//! # Overview
//!
//! [`ShareScanner`] runs a full scan over every configured share:
//!
//! 1. **Walk** every share root and bucket regular files by exact size,
//!    merging hardlinks by identity (see [`super::groups`]).
//! 2. **Persist trivial outcomes**: zero-byte files receive
//!    [`EMPTY_DIGEST`](crate::hasher::EMPTY_DIGEST) directly, files unique by
//!    size are stored unhashed.
//! 3. **Compare** every bucket of two or more identities with the
//!    [`Comparator`]. Buckets are independent jobs and run concurrently.
//! 4. **Persist** each bucket's outcome with bounded retries.
//!
//! # Example
//!
//! ```no_run
//! use dupewatch::duplicates::{Comparator, ComparatorConfig, FinderConfig, ShareScanner};
//! use dupewatch::events::CancellationRegistry;
//! use dupewatch::hasher::HashPool;
//! use dupewatch::shares::ShareMap;
//! use dupewatch::store::SqliteRepository;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(HashPool::new(HashPool::default_size()).unwrap());
//! let cancel = Arc::new(CancellationRegistry::new());
//! let comparator = Arc::new(Comparator::new(pool, cancel, ComparatorConfig::default()).unwrap());
//! let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
//! let shares = ShareMap::default().with_share("media", "/mnt/user/media");
//!
//! let scanner = ShareScanner::new(comparator, repo, shares, FinderConfig::default());
//! let summary = scanner.scan().unwrap();
//! println!("{} duplicate groups", summary.duplicate_groups);
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::comparator::{CompareMember, Comparator, Verdict};
use super::groups::{SizeBuckets, SizeGroup};
use crate::hasher::EMPTY_DIGEST;
use crate::progress::{ProgressCallback, PHASE_COMPARING, PHASE_WALKING};
use crate::scanner::{ScanError, Walker, WalkerConfig};
use crate::shares::ShareMap;
use crate::store::{save_all_with_retries, FileRecord, MetadataRepository, RetryPolicy};

/// Configuration for a share scan.
#[derive(Clone)]
pub struct FinderConfig {
    /// Walker configuration for directory traversal.
    pub walker_config: WalkerConfig,
    /// Size groups compared at the same time.
    pub parallel_groups: usize,
    /// Retry policy for persisting results.
    pub retry: RetryPolicy,
    /// Optional shutdown flag for graceful termination.
    pub shutdown_flag: Option<Arc<AtomicBool>>,
    /// Optional progress callback for reporting.
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
}

impl std::fmt::Debug for FinderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinderConfig")
            .field("walker_config", &self.walker_config)
            .field("parallel_groups", &self.parallel_groups)
            .field("retry", &self.retry)
            .field("shutdown_flag", &self.shutdown_flag)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            walker_config: WalkerConfig::default(),
            parallel_groups: 2,
            retry: RetryPolicy::default(),
            shutdown_flag: None,
            progress_callback: None,
        }
    }
}

impl FinderConfig {
    /// Set the walker configuration.
    #[must_use]
    pub fn with_walker_config(mut self, config: WalkerConfig) -> Self {
        self.walker_config = config;
        self
    }

    /// Set how many size groups are compared at once.
    #[must_use]
    pub fn with_parallel_groups(mut self, groups: usize) -> Self {
        self.parallel_groups = groups.max(1);
        self
    }

    /// Set the persistence retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

/// Summary statistics from a share scan.
#[derive(Debug, Default)]
pub struct ScanSummary {
    /// Paths visited, hardlink names included
    pub total_files: usize,
    /// Total size of distinct identities in bytes
    pub total_size: u64,
    /// Hardlink names merged into an existing identity
    pub hardlinks_merged: usize,
    /// Zero-byte identities given the empty digest
    pub empty_files: usize,
    /// Identities unique by size, stored unhashed
    pub eliminated_by_size: usize,
    /// Size groups sent to the comparator
    pub compared_groups: usize,
    /// Comparison rounds over all groups
    pub rounds: u64,
    /// Bytes read and hashed over all groups
    pub bytes_compared: u64,
    /// Identities dropped by a read or hash failure
    pub failed_files: usize,
    /// Confirmed duplicate groups
    pub duplicate_groups: usize,
    /// Identities that are redundant copies (group size minus one, summed)
    pub duplicate_files: usize,
    /// Bytes reclaimable by keeping one identity per group
    pub reclaimable_space: u64,
    /// Records whose write was abandoned after retries
    pub persist_failures: usize,
    /// Duration of the entire scan
    pub scan_duration: Duration,
    /// Walk errors, logged and skipped
    pub scan_errors: Vec<ScanError>,
}

impl ScanSummary {
    /// Format reclaimable space as a human-readable string.
    #[must_use]
    pub fn reclaimable_display(&self) -> String {
        bytesize::ByteSize(self.reclaimable_space).to_string()
    }

    /// Format total size as a human-readable string.
    #[must_use]
    pub fn total_size_display(&self) -> String {
        bytesize::ByteSize(self.total_size).to_string()
    }

    /// Whether some work was skipped or lost.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.scan_errors.is_empty() || self.persist_failures > 0 || self.failed_files > 0
    }
}

/// Errors that abort a share scan.
#[derive(thiserror::Error, Debug)]
pub enum FinderError {
    /// The scan was interrupted by user (Ctrl+C or shutdown signal).
    #[error("Scan interrupted by user")]
    Interrupted,

    /// No share root was configured.
    #[error("No shares configured")]
    NoShares,

    /// A share root does not exist.
    #[error("Share '{name}' not found: {path}")]
    ShareNotFound {
        /// Share name
        name: String,
        /// Configured root
        path: PathBuf,
    },

    /// A share root is not a directory.
    #[error("Share '{name}' is not a directory: {path}")]
    NotADirectory {
        /// Share name
        name: String,
        /// Configured root
        path: PathBuf,
    },

    /// The group comparison pool could not be started.
    #[error("failed to start comparison workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Per-group result folded into the summary.
#[derive(Default)]
struct GroupResult {
    rounds: u64,
    bytes_compared: u64,
    failed: usize,
    duplicate_groups: usize,
    duplicate_files: usize,
    reclaimable: u64,
    persist_failures: usize,
}

/// Scans every configured share and persists what it learns.
pub struct ShareScanner {
    comparator: Arc<Comparator>,
    repo: Arc<dyn MetadataRepository>,
    shares: ShareMap,
    config: FinderConfig,
}

impl std::fmt::Debug for ShareScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareScanner")
            .field("comparator", &self.comparator)
            .field("shares", &self.shares)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ShareScanner {
    /// Create a scanner over `shares`.
    #[must_use]
    pub fn new(
        comparator: Arc<Comparator>,
        repo: Arc<dyn MetadataRepository>,
        shares: ShareMap,
        config: FinderConfig,
    ) -> Self {
        Self {
            comparator,
            repo,
            shares,
            config,
        }
    }

    /// Run a complete scan.
    ///
    /// # Errors
    ///
    /// Returns [`FinderError`] if no share is configured, a share root is
    /// missing or not a directory, or the scan is interrupted. Results of
    /// groups finished before an interruption stay persisted.
    pub fn scan(&self) -> Result<ScanSummary, FinderError> {
        let start = Instant::now();
        self.validate_roots()?;

        let mut summary = ScanSummary::default();
        let mut buckets = SizeBuckets::new(self.shares.clone());

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_phase_start(PHASE_WALKING, 0);
        }
        let mut visited = 0usize;
        for (name, root) in self.shares.roots() {
            log::info!("Walking share '{}' at {}", name, root.display());
            let mut walker = Walker::new(root, self.config.walker_config.clone());
            if let Some(ref flag) = self.config.shutdown_flag {
                walker = walker.with_shutdown_flag(Arc::clone(flag));
            }
            for entry in walker.walk() {
                match entry {
                    Ok(file) => {
                        visited += 1;
                        if let Some(ref cb) = self.config.progress_callback {
                            cb.on_progress(visited, &file.path.to_string_lossy());
                        }
                        buckets.insert(file);
                    }
                    Err(e) => summary.scan_errors.push(e),
                }
            }
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_phase_end(PHASE_WALKING);
        }
        if self.config.is_shutdown_requested() {
            return Err(FinderError::Interrupted);
        }

        let scan = buckets.finish();
        summary.total_files = scan.stats.total_files;
        summary.total_size = scan.stats.total_size;
        summary.hardlinks_merged = scan.stats.hardlinks_merged;
        summary.empty_files = scan.stats.empty_files;
        summary.eliminated_by_size = scan.stats.eliminated_unique;
        summary.compared_groups = scan.groups.len();

        log::info!(
            "Found {} files ({} identities unique by size, {} empty, {} size groups)",
            summary.total_files,
            summary.eliminated_by_size,
            summary.empty_files,
            summary.compared_groups
        );

        let mut trivial = scan.empty;
        for record in &mut trivial {
            record.hash = Some(EMPTY_DIGEST);
        }
        if trivial.len() > 1 {
            summary.duplicate_groups += 1;
            summary.duplicate_files += trivial.len() - 1;
        }
        trivial.extend(scan.unique);
        if !save_all_with_retries(self.repo.as_ref(), &trivial, &self.config.retry) {
            summary.persist_failures += trivial.len();
        }

        let totals = self.compare_groups(scan.groups)?;
        summary.rounds = totals.rounds;
        summary.bytes_compared = totals.bytes_compared;
        summary.failed_files = totals.failed;
        summary.duplicate_groups += totals.duplicate_groups;
        summary.duplicate_files += totals.duplicate_files;
        summary.reclaimable_space = totals.reclaimable;
        summary.persist_failures += totals.persist_failures;
        summary.scan_duration = start.elapsed();

        if self.config.is_shutdown_requested() {
            return Err(FinderError::Interrupted);
        }

        log::info!(
            "Scan complete in {:.2?}: {} duplicate groups, {} reclaimable",
            summary.scan_duration,
            summary.duplicate_groups,
            summary.reclaimable_display()
        );
        Ok(summary)
    }

    fn validate_roots(&self) -> Result<(), FinderError> {
        if self.shares.is_empty() {
            return Err(FinderError::NoShares);
        }
        for (name, root) in self.shares.roots() {
            if !root.exists() {
                return Err(FinderError::ShareNotFound {
                    name: name.to_string(),
                    path: root.to_path_buf(),
                });
            }
            if !root.is_dir() {
                return Err(FinderError::NotADirectory {
                    name: name.to_string(),
                    path: root.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    fn compare_groups(&self, groups: Vec<SizeGroup>) -> Result<GroupResult, FinderError> {
        if groups.is_empty() {
            return Ok(GroupResult::default());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_groups.max(1))
            .thread_name(|i| format!("scan-group-{i}"))
            .build()?;

        let total = groups.len();
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_phase_start(PHASE_COMPARING, total);
        }

        let done = std::sync::atomic::AtomicUsize::new(0);
        let totals = Mutex::new(GroupResult::default());
        pool.install(|| {
            groups.into_par_iter().for_each(|group| {
                if self.config.is_shutdown_requested() {
                    return;
                }
                let label = group
                    .records
                    .first()
                    .and_then(FileRecord::primary_path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let result = self.compare_group(group);

                let mut t = totals.lock();
                t.rounds += result.rounds;
                t.bytes_compared += result.bytes_compared;
                t.failed += result.failed;
                t.duplicate_groups += result.duplicate_groups;
                t.duplicate_files += result.duplicate_files;
                t.reclaimable += result.reclaimable;
                t.persist_failures += result.persist_failures;
                drop(t);

                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(ref cb) = self.config.progress_callback {
                    cb.on_progress(n, &label);
                    cb.on_item_completed(result.bytes_compared);
                }
            });
        });

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_phase_end(PHASE_COMPARING);
        }
        Ok(totals.into_inner())
    }

    /// Compare one size group and persist its records.
    fn compare_group(&self, group: SizeGroup) -> GroupResult {
        let members: Vec<CompareMember> = group
            .records
            .iter()
            .filter_map(|r| Some(CompareMember::new(r.id, r.primary_path()?.to_path_buf())))
            .collect();
        let outcome = self.comparator.compare(group.size, members);

        let mut result = GroupResult {
            rounds: u64::from(outcome.rounds),
            bytes_compared: outcome.bytes_compared,
            ..GroupResult::default()
        };
        for confirmed in &outcome.groups {
            result.duplicate_groups += 1;
            result.duplicate_files += confirmed.members.len() - 1;
            result.reclaimable += group.size * (confirmed.members.len() as u64 - 1);
        }

        let mut records = Vec::with_capacity(group.records.len());
        for mut record in group.records {
            match outcome.verdict(record.id) {
                Some(Verdict::Confirmed(hash)) => record.hash = Some(hash),
                Some(Verdict::Cancelled) => {
                    log::debug!("{} was removed during comparison, not storing", record.id);
                    continue;
                }
                Some(Verdict::Failed) => {
                    result.failed += 1;
                    record.hash = None;
                }
                Some(Verdict::Unique) | None => record.hash = None,
            }
            records.push(record);
        }

        if !save_all_with_retries(self.repo.as_ref(), &records, &self.config.retry) {
            result.persist_failures += records.len();
        }
        result
    }
}
