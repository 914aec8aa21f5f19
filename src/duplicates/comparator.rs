//! Chunked, progressively narrowing content comparison.
//!
//! # Overview
//!
//! Given N same-size files, the comparator decides which subsets are
//! byte-identical while reading as little as possible:
//!
//! 1. Every member starts in one candidate group.
//! 2. Each round reads the next chunk of every member of every active group
//!    (concurrently, on a bounded I/O pool) and feeds it to that file's
//!    accumulator in the [`HashPool`].
//! 3. Each group is partitioned by the returned running digest. Members left
//!    alone in a partition are unique and stop being read.
//! 4. When the last chunk has been consumed, every surviving group is
//!    byte-identical and its running digest is the whole-content hash.
//!
//! A unique file is dropped at the first chunk where it differs, so its cost
//! is proportional to the divergence point rather than its size.
//!
//! Per-file faults (open/read failures, truncation, worker errors) drop only
//! that file. Removal signals from the [`CancellationRegistry`] are drained
//! at the start of every round and drop matching members.
//!
//! # Example
//!
//! ```no_run
//! use dupewatch::duplicates::{CompareMember, Comparator, ComparatorConfig};
//! use dupewatch::events::CancellationRegistry;
//! use dupewatch::hasher::HashPool;
//! use dupewatch::scanner::FileId;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(HashPool::new(HashPool::default_size()).unwrap());
//! let cancel = Arc::new(CancellationRegistry::new());
//! let comparator = Comparator::new(pool, cancel, ComparatorConfig::default()).unwrap();
//!
//! let outcome = comparator.compare(
//!     1024,
//!     vec![
//!         CompareMember::new(FileId(1), "/mnt/user/a/x".into()),
//!         CompareMember::new(FileId(2), "/mnt/user/b/x".into()),
//!     ],
//! );
//! println!("{} confirmed groups", outcome.groups.len());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::events::cancel::{CancelKey, CancellationRegistry, Subscription};
use crate::hasher::{Hash, HashPool, PendingDigest, SessionId, EMPTY_DIGEST};
use crate::scanner::FileId;

/// Default comparison chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of concurrent readers per comparator.
pub const DEFAULT_IO_THREADS: usize = 4;

/// One file taking part in a comparison, read through `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareMember {
    /// File identity
    pub id: FileId,
    /// Name the content is read through
    pub path: PathBuf,
}

impl CompareMember {
    /// Create a member.
    #[must_use]
    pub fn new(id: FileId, path: PathBuf) -> Self {
        Self { id, path }
    }
}

/// What a comparison session concluded about one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Identical to at least one other member; whole-content digest
    Confirmed(Hash),
    /// Differs from every other member
    Unique,
    /// Could not be read or hashed
    Failed,
    /// Dropped because of a removal signal
    Cancelled,
}

/// A set of members confirmed byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedGroup {
    /// Whole-content digest
    pub hash: Hash,
    /// Members, in input order
    pub members: Vec<FileId>,
}

/// Result of one comparison session.
#[derive(Debug, Clone, Default)]
pub struct ComparisonOutcome {
    /// Verdict per input identity
    pub verdicts: BTreeMap<FileId, Verdict>,
    /// Byte-identical groups of two or more
    pub groups: Vec<ConfirmedGroup>,
    /// Chunk rounds executed
    pub rounds: u32,
    /// Bytes read and hashed, over all members
    pub bytes_compared: u64,
}

impl ComparisonOutcome {
    /// Verdict for one identity.
    #[must_use]
    pub fn verdict(&self, id: FileId) -> Option<Verdict> {
        self.verdicts.get(&id).copied()
    }

    /// Confirmed hash for one identity, if any.
    #[must_use]
    pub fn hash_of(&self, id: FileId) -> Option<Hash> {
        match self.verdicts.get(&id) {
            Some(Verdict::Confirmed(hash)) => Some(*hash),
            _ => None,
        }
    }

    /// Number of members whose verdict satisfies `pred`.
    #[must_use]
    pub fn count_where(&self, pred: impl Fn(&Verdict) -> bool) -> usize {
        self.verdicts.values().filter(|v| pred(v)).count()
    }
}

/// Errors creating a comparator.
#[derive(thiserror::Error, Debug)]
pub enum CompareError {
    /// The read pool could not be started.
    #[error("failed to start comparison read pool: {0}")]
    ReadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Comparator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparatorConfig {
    /// Bytes per round per file
    pub chunk_size: usize,
    /// Concurrent file reads
    pub io_threads: usize,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_threads: DEFAULT_IO_THREADS,
        }
    }
}

impl ComparatorConfig {
    /// Set the chunk size (at least one byte).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the number of concurrent readers (at least one).
    #[must_use]
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }
}

/// Runs comparison sessions against a shared [`HashPool`].
///
/// Sessions are independent; any number may run concurrently on one
/// comparator.
pub struct Comparator {
    pool: Arc<HashPool>,
    cancellation: Arc<CancellationRegistry>,
    chunk_size: usize,
    readers: rayon::ThreadPool,
    next_session: AtomicU64,
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparator")
            .field("pool", &self.pool)
            .field("chunk_size", &self.chunk_size)
            .field("io_threads", &self.readers.current_num_threads())
            .finish_non_exhaustive()
    }
}

/// Member state within one session.
struct Slot {
    member: CompareMember,
    file: Option<File>,
}

/// Group still indistinguishable after the bytes read so far.
struct Candidate {
    members: Vec<usize>,
    digest: Option<Hash>,
}

/// Clears the session's accumulators however the session ends.
struct SessionGuard<'a> {
    pool: &'a HashPool,
    session: SessionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.pool.reset(self.session);
    }
}

impl Comparator {
    /// Create a comparator using `pool` for hashing.
    ///
    /// # Errors
    ///
    /// Returns [`CompareError::ReadPool`] if the read threads cannot start.
    pub fn new(
        pool: Arc<HashPool>,
        cancellation: Arc<CancellationRegistry>,
        config: ComparatorConfig,
    ) -> Result<Self, CompareError> {
        let readers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.io_threads.max(1))
            .thread_name(|i| format!("compare-io-{i}"))
            .build()?;
        Ok(Self {
            pool,
            cancellation,
            chunk_size: config.chunk_size.max(1),
            readers,
            next_session: AtomicU64::new(1),
        })
    }

    /// Bytes read per file per round.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The hash pool this comparator feeds.
    #[must_use]
    pub fn pool(&self) -> &Arc<HashPool> {
        &self.pool
    }

    /// Compare files that all claim to be `size` bytes long.
    ///
    /// Repeated identities are compared once. The session's accumulators are
    /// reset before this returns.
    #[must_use]
    pub fn compare(&self, size: u64, members: Vec<CompareMember>) -> ComparisonOutcome {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let _guard = SessionGuard {
            pool: &self.pool,
            session,
        };
        let subscription = self.cancellation.subscribe();
        let mut outcome = ComparisonOutcome::default();

        let mut slots: Vec<Slot> = Vec::with_capacity(members.len());
        for member in members {
            if outcome.verdicts.contains_key(&member.id) {
                log::debug!(
                    "{}: {} listed twice, comparing once",
                    session,
                    member.id
                );
                continue;
            }
            let file = match File::open(&member.path) {
                Ok(file) => Some(file),
                Err(e) => {
                    log::warn!("Cannot open {}: {}", member.path.display(), e);
                    outcome.verdicts.insert(member.id, Verdict::Failed);
                    None
                }
            };
            if file.is_some() {
                outcome.verdicts.insert(member.id, Verdict::Unique);
            }
            slots.push(Slot { member, file });
        }

        let open: Vec<usize> = (0..slots.len())
            .filter(|&i| slots[i].file.is_some())
            .collect();
        log::debug!(
            "{}: comparing {} files of {} bytes",
            session,
            open.len(),
            size
        );

        let mut groups = vec![Candidate {
            members: open,
            digest: if size == 0 { Some(EMPTY_DIGEST) } else { None },
        }];
        let mut offset = 0u64;

        while offset < size {
            apply_cancellations(&subscription, &mut slots, &mut groups, &mut outcome);
            groups.retain(|g| g.members.len() > 1);
            if groups.is_empty() {
                break;
            }

            outcome.rounds += 1;
            let len = usize::try_from(size - offset)
                .map_or(self.chunk_size, |remaining| remaining.min(self.chunk_size));

            let chunks = self.read_round(&mut slots, &groups, len);
            let digests = self.hash_round(session, &mut slots, chunks, &mut outcome);
            outcome.bytes_compared += len as u64 * digests.len() as u64;

            groups = partition(groups, &digests, &mut slots);
            offset += len as u64;
            log::trace!(
                "{}: round {} done at offset {}, {} active groups",
                session,
                outcome.rounds,
                offset,
                groups.len()
            );
        }

        // Removals that arrived during the final round still count.
        apply_cancellations(&subscription, &mut slots, &mut groups, &mut outcome);

        for group in groups {
            if group.members.len() < 2 {
                continue;
            }
            let Some(hash) = group.digest else {
                continue;
            };
            let ids: Vec<FileId> = group.members.iter().map(|&i| slots[i].member.id).collect();
            for id in &ids {
                outcome.verdicts.insert(*id, Verdict::Confirmed(hash));
            }
            outcome.groups.push(ConfirmedGroup { hash, members: ids });
        }

        log::debug!(
            "{}: {} confirmed groups after {} rounds ({} bytes read)",
            session,
            outcome.groups.len(),
            outcome.rounds,
            outcome.bytes_compared
        );
        outcome
    }

    /// Read the next `len` bytes of every active member concurrently.
    fn read_round(
        &self,
        slots: &mut [Slot],
        groups: &[Candidate],
        len: usize,
    ) -> Vec<(usize, std::io::Result<Vec<u8>>)> {
        let mut active = vec![false; slots.len()];
        for group in groups {
            for &i in &group.members {
                active[i] = true;
            }
        }

        self.readers.install(|| {
            slots
                .par_iter_mut()
                .enumerate()
                .filter(|(i, _)| active[*i])
                .filter_map(|(i, slot)| {
                    let file = slot.file.as_mut()?;
                    let mut buf = vec![0u8; len];
                    Some((i, file.read_exact(&mut buf).map(|()| buf)))
                })
                .collect()
        })
    }

    /// Dispatch the whole round to the pool, then collect every digest.
    fn hash_round(
        &self,
        session: SessionId,
        slots: &mut [Slot],
        chunks: Vec<(usize, std::io::Result<Vec<u8>>)>,
        outcome: &mut ComparisonOutcome,
    ) -> HashMap<usize, Hash> {
        let mut pending: Vec<(usize, PendingDigest)> = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks {
            let slot = &mut slots[i];
            match chunk {
                Ok(bytes) => pending.push((i, self.pool.process(session, slot.member.id, bytes))),
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        log::warn!(
                            "{} was truncated during comparison, dropping it",
                            slot.member.path.display()
                        );
                    } else {
                        log::warn!("Read failed for {}: {}", slot.member.path.display(), e);
                    }
                    slot.file = None;
                    outcome.verdicts.insert(slot.member.id, Verdict::Failed);
                }
            }
        }

        let mut digests = HashMap::with_capacity(pending.len());
        for (i, p) in pending {
            match p.wait() {
                Ok(digest) => {
                    digests.insert(i, digest);
                }
                Err(e) => {
                    log::warn!("{}", e);
                    slots[i].file = None;
                    outcome.verdicts.insert(slots[i].member.id, Verdict::Failed);
                }
            }
        }
        digests
    }
}

/// Drop members named by removal signals received since the last round.
fn apply_cancellations(
    subscription: &Subscription,
    slots: &mut [Slot],
    groups: &mut [Candidate],
    outcome: &mut ComparisonOutcome,
) {
    let keys = subscription.drain();
    if keys.is_empty() {
        return;
    }
    for group in groups.iter_mut() {
        group.members.retain(|&i| {
            let slot = &mut slots[i];
            let hit = keys.iter().any(|key| match key {
                CancelKey::File(id) => *id == slot.member.id,
                CancelKey::Path(path) => *path == slot.member.path,
            });
            if hit {
                log::debug!(
                    "Dropping {} ({}) from comparison: removed",
                    slot.member.id,
                    slot.member.path.display()
                );
                slot.file = None;
                outcome.verdicts.insert(slot.member.id, Verdict::Cancelled);
            }
            !hit
        });
    }
}

/// Split each group by running digest, dropping members without one and
/// closing members left alone.
fn partition(
    groups: Vec<Candidate>,
    digests: &HashMap<usize, Hash>,
    slots: &mut [Slot],
) -> Vec<Candidate> {
    let mut next = Vec::new();
    for group in groups {
        let mut parts: Vec<Candidate> = Vec::new();
        for i in group.members {
            let Some(digest) = digests.get(&i) else {
                continue;
            };
            match parts.iter_mut().find(|p| p.digest.as_ref() == Some(digest)) {
                Some(part) => part.members.push(i),
                None => parts.push(Candidate {
                    members: vec![i],
                    digest: Some(*digest),
                }),
            }
        }
        for part in parts {
            if part.members.len() > 1 {
                next.push(part);
            } else {
                for &i in &part.members {
                    slots[i].file = None;
                }
            }
        }
    }
    next
}
