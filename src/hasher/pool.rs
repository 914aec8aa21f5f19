//! Fixed pool of hash worker threads.
//!
//! # Overview
//!
//! Each worker is a dedicated thread that exclusively owns a map of
//! [`AccumulatorKey`] → `blake3::Hasher`. Nothing is shared between workers;
//! all interaction goes through the worker's channel:
//!
//! - `process(session, file, bytes)` feeds a chunk into the file's
//!   accumulator (creating it on first use) and replies with the digest of
//!   everything fed so far. The accumulator stays usable for more bytes.
//! - `reset(session)` drops every accumulator belonging to one comparison
//!   session. Concurrent sessions keep theirs.
//! - `reset_all()` drops every accumulator on every worker.
//!
//! A file is pinned to one worker for the lifetime of its session, so its
//! accumulator never has to migrate.
//!
//! The pool lives as long as its owner; dropping it stops and joins every
//! worker.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::Hash;
use crate::scanner::FileId;

/// Identifies one comparison session.
///
/// Accumulators are keyed by session as well as file so that two sessions
/// comparing the same file at the same time never share digest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Key of one incremental digest accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccumulatorKey {
    /// Owning comparison session
    pub session: SessionId,
    /// File being digested
    pub file: FileId,
}

/// Failure to hash one chunk for one file.
///
/// Scoped to that file only; siblings in the same round are unaffected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker owning this file is gone (channel closed).
    #[error("hash worker {worker} is unavailable for {file}")]
    Disconnected {
        /// Index of the worker the file was pinned to
        worker: usize,
        /// File whose chunk could not be hashed
        file: FileId,
    },

    /// Hashing panicked inside the worker; the accumulator was discarded.
    #[error("hash worker {worker} panicked while hashing {file}")]
    Panicked {
        /// Index of the worker the file was pinned to
        worker: usize,
        /// File whose chunk could not be hashed
        file: FileId,
    },
}

/// Errors creating the pool.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn hash worker {index}: {source}")]
    Spawn {
        /// Index of the worker that failed to start
        index: usize,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

enum WorkerMessage {
    Process {
        key: AccumulatorKey,
        bytes: Vec<u8>,
        reply: Sender<Result<Hash, WorkerError>>,
    },
    Reset {
        session: SessionId,
    },
    ResetAll,
    Count {
        reply: Sender<usize>,
    },
    Shutdown,
}

struct WorkerHandle {
    tx: Sender<WorkerMessage>,
    join: Option<JoinHandle<()>>,
}

/// A digest that has been requested but not yet collected.
///
/// Returned by [`HashPool::process`] so a caller can dispatch a whole round
/// of chunks before blocking on any of them.
#[derive(Debug)]
pub struct PendingDigest {
    file: FileId,
    worker: usize,
    rx: Receiver<Result<Hash, WorkerError>>,
}

impl PendingDigest {
    /// File this digest belongs to.
    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Block until the worker replies.
    ///
    /// # Errors
    ///
    /// Returns the worker's error, or [`WorkerError::Disconnected`] if the
    /// worker went away before replying.
    pub fn wait(self) -> Result<Hash, WorkerError> {
        self.rx.recv().unwrap_or(Err(WorkerError::Disconnected {
            worker: self.worker,
            file: self.file,
        }))
    }
}

/// Pool of hash workers.
///
/// # Example
///
/// ```
/// use dupewatch::hasher::{HashPool, SessionId};
/// use dupewatch::scanner::FileId;
///
/// let pool = HashPool::new(2).unwrap();
/// let session = SessionId(1);
///
/// let first = pool.process(session, FileId(7), b"hello ".to_vec()).wait().unwrap();
/// let second = pool.process(session, FileId(7), b"world".to_vec()).wait().unwrap();
/// assert_eq!(second, *blake3::hash(b"hello world").as_bytes());
/// assert_ne!(first, second);
///
/// pool.reset(session);
/// ```
pub struct HashPool {
    workers: Vec<WorkerHandle>,
}

impl std::fmt::Debug for HashPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl HashPool {
    /// Start a pool with `size` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a worker thread cannot be started.
    /// Workers already started are shut down when the partial pool drops.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let mut pool = Self {
            workers: Vec::with_capacity(size),
        };

        for index in 0..size {
            let (tx, rx) = unbounded::<WorkerMessage>();
            let join = thread::Builder::new()
                .name(format!("hash-worker-{index}"))
                .spawn(move || worker_loop(index, &rx))
                .map_err(|source| PoolError::Spawn { index, source })?;
            pool.workers.push(WorkerHandle {
                tx,
                join: Some(join),
            });
        }

        log::debug!("Hash pool started with {} workers", size);
        Ok(pool)
    }

    /// Default pool size: one less than the available parallelism, at least one.
    #[must_use]
    pub fn default_size() -> usize {
        thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Worker a file is pinned to for the given session.
    #[must_use]
    pub fn worker_for(&self, session: SessionId, file: FileId) -> usize {
        let mixed = file
            .0
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(session.0);
        (mixed % self.workers.len() as u64) as usize
    }

    /// Feed a chunk into the file's accumulator for this session.
    ///
    /// The chunk is moved to the worker; no copy is made. The returned
    /// [`PendingDigest`] resolves to the digest of every byte fed so far.
    pub fn process(&self, session: SessionId, file: FileId, bytes: Vec<u8>) -> PendingDigest {
        let worker = self.worker_for(session, file);
        let (reply, rx) = bounded(1);
        let message = WorkerMessage::Process {
            key: AccumulatorKey { session, file },
            bytes,
            reply,
        };
        // On a closed channel the reply sender is dropped with the message,
        // so `wait` reports the worker as disconnected.
        if self.workers[worker].tx.send(message).is_err() {
            log::warn!("Hash worker {} is gone; {} cannot be hashed", worker, file);
        }
        PendingDigest { file, worker, rx }
    }

    /// Discard every accumulator belonging to `session` on every worker.
    pub fn reset(&self, session: SessionId) {
        for handle in &self.workers {
            let _ = handle.tx.send(WorkerMessage::Reset { session });
        }
        log::trace!("Hash pool reset for {}", session);
    }

    /// Discard every accumulator on every worker.
    pub fn reset_all(&self) {
        for handle in &self.workers {
            let _ = handle.tx.send(WorkerMessage::ResetAll);
        }
    }

    /// Total number of live accumulators across all workers.
    ///
    /// Messages are processed in order per worker, so this observes every
    /// `process`/`reset` sent before the call.
    #[must_use]
    pub fn live_accumulators(&self) -> usize {
        let replies: Vec<Receiver<usize>> = self
            .workers
            .iter()
            .filter_map(|handle| {
                let (reply, rx) = bounded(1);
                handle.tx.send(WorkerMessage::Count { reply }).ok()?;
                Some(rx)
            })
            .collect();
        replies.into_iter().filter_map(|rx| rx.recv().ok()).sum()
    }

    /// Stop one worker, leaving its channel in place.
    #[cfg(test)]
    pub(crate) fn stop_worker(&self, index: usize) {
        let _ = self.workers[index].tx.send(WorkerMessage::Shutdown);
    }
}

impl Drop for HashPool {
    fn drop(&mut self) {
        for handle in &self.workers {
            let _ = handle.tx.send(WorkerMessage::Shutdown);
        }
        for (index, handle) in self.workers.iter_mut().enumerate() {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    log::warn!("Hash worker {} exited abnormally", index);
                }
            }
        }
        log::debug!("Hash pool shut down");
    }
}

fn worker_loop(index: usize, rx: &Receiver<WorkerMessage>) {
    let mut accumulators: HashMap<AccumulatorKey, blake3::Hasher> = HashMap::new();

    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::Process { key, bytes, reply } => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    let hasher = accumulators.entry(key).or_default();
                    hasher.update(&bytes);
                    *hasher.finalize().as_bytes()
                }));
                let result = result.map_err(|_| {
                    accumulators.remove(&key);
                    log::error!("Hash worker {} panicked while hashing {}", index, key.file);
                    WorkerError::Panicked {
                        worker: index,
                        file: key.file,
                    }
                });
                // The requester may have given up on this file; that is fine.
                let _ = reply.send(result);
            }
            WorkerMessage::Reset { session } => {
                accumulators.retain(|key, _| key.session != session);
            }
            WorkerMessage::ResetAll => accumulators.clear(),
            WorkerMessage::Count { reply } => {
                let _ = reply.send(accumulators.len());
            }
            WorkerMessage::Shutdown => break,
        }
    }

    log::trace!("Hash worker {} stopped", index);
}
