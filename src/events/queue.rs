//! In-process event queue with per-key ordering and redelivery.
//!
//! # Overview
//!
//! The queue owns a fixed number of partitions, each drained by a single
//! consumer thread. An event's [`OrderingKey`] picks its partition, so all
//! events for one key are handled one at a time, in submission order.
//! Events for different keys may be handled concurrently.
//!
//! Delivery is at-least-once: when the handler fails with a retryable error
//! the event is redelivered in place (later events for the same partition
//! wait) after a fixed backoff, up to a maximum number of attempts. An event
//! that exhausts its attempts is logged and dropped.
//!
//! # Example
//!
//! ```no_run
//! use dupewatch::events::{ChangeEvent, EventHandler, EventQueue, QueueConfig};
//! use std::sync::Arc;
//! # fn handler() -> Arc<dyn EventHandler> { unimplemented!() }
//!
//! let queue = EventQueue::start(handler(), QueueConfig::default()).unwrap();
//! queue.push(ChangeEvent::Upsert { path: "/mnt/user/a/x".into() }).unwrap();
//! queue.wait_idle();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::{ChangeEvent, EventHandler, OrderingKey};

/// Queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of partitions (consumer threads)
    pub partitions: usize,
    /// Deliveries per event, including the first
    pub max_delivery_attempts: u32,
    /// Pause before a redelivery
    pub redelivery_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_delivery_attempts: 5,
            redelivery_backoff: Duration::from_secs(1),
        }
    }
}

/// Queue errors.
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// The partition's consumer is gone.
    #[error("event queue partition {0} is closed")]
    Closed(usize),

    /// A consumer thread could not be started.
    #[error("failed to spawn event consumer {index}: {source}")]
    Spawn {
        /// Partition index
        index: usize,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted by `push`
    pub submitted: u64,
    /// Events the handler accepted
    pub delivered: u64,
    /// Redeliveries after a retryable failure
    pub redelivered: u64,
    /// Events dropped after a permanent failure or exhausted attempts
    pub abandoned: u64,
}

enum Envelope {
    Event(ChangeEvent),
    Shutdown,
}

#[derive(Default)]
struct Shared {
    paused: Mutex<bool>,
    resumed: Condvar,
    pending: Mutex<usize>,
    idle: Condvar,
    submitted: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    abandoned: AtomicU64,
}

impl Shared {
    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Partitioned event queue feeding an [`EventHandler`].
pub struct EventQueue {
    senders: Vec<Sender<Envelope>>,
    consumers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("partitions", &self.senders.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventQueue {
    /// Start one consumer per partition.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Spawn`] if a consumer thread cannot start.
    pub fn start(handler: Arc<dyn EventHandler>, config: QueueConfig) -> Result<Self, QueueError> {
        let partitions = config.partitions.max(1);
        let shared = Arc::new(Shared::default());
        let mut queue = Self {
            senders: Vec::with_capacity(partitions),
            consumers: Vec::with_capacity(partitions),
            shared: Arc::clone(&shared),
        };

        for index in 0..partitions {
            let (tx, rx) = unbounded();
            let handler = Arc::clone(&handler);
            let shared = Arc::clone(&shared);
            let consumer = thread::Builder::new()
                .name(format!("event-consumer-{index}"))
                .spawn(move || consume(index, &rx, handler.as_ref(), &shared, config))
                .map_err(|source| QueueError::Spawn { index, source })?;
            queue.senders.push(tx);
            queue.consumers.push(consumer);
        }

        log::debug!("Event queue started with {} partitions", partitions);
        Ok(queue)
    }

    /// Number of partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Submit an event ordered by its primary path.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the partition's consumer is gone.
    pub fn push(&self, event: ChangeEvent) -> Result<(), QueueError> {
        let key = event.ordering_key();
        self.push_keyed(&key, event)
    }

    /// Submit an event ordered by an explicit key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the partition's consumer is gone.
    pub fn push_keyed(&self, key: &OrderingKey, event: ChangeEvent) -> Result<(), QueueError> {
        let partition = key.partition(self.senders.len());
        *self.shared.pending.lock() += 1;
        if self.senders[partition].send(Envelope::Event(event)).is_err() {
            self.shared.finish_one();
            return Err(QueueError::Closed(partition));
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop starting new deliveries; deliveries in progress finish.
    pub fn pause(&self) {
        *self.shared.paused.lock() = true;
        log::debug!("Event queue paused");
    }

    /// Resume deliveries.
    pub fn resume(&self) {
        *self.shared.paused.lock() = false;
        self.shared.resumed.notify_all();
        log::debug!("Event queue resumed");
    }

    /// Whether the queue is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.lock()
    }

    /// Events submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Block until every submitted event has been handled or dropped.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with a deadline. Returns whether
    /// the queue became idle.
    #[must_use]
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self.shared.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            redelivered: self.shared.redelivered.load(Ordering::Relaxed),
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.resume();
        for tx in &self.senders {
            let _ = tx.send(Envelope::Shutdown);
        }
        for (index, consumer) in self.consumers.drain(..).enumerate() {
            if consumer.join().is_err() {
                log::warn!("Event consumer {} exited abnormally", index);
            }
        }
        log::debug!("Event queue stopped");
    }
}

fn consume(
    index: usize,
    rx: &Receiver<Envelope>,
    handler: &dyn EventHandler,
    shared: &Shared,
    config: QueueConfig,
) {
    let max_attempts = config.max_delivery_attempts.max(1);
    while let Ok(envelope) = rx.recv() {
        let event = match envelope {
            Envelope::Event(event) => event,
            Envelope::Shutdown => break,
        };

        let mut attempt = 1;
        loop {
            shared.wait_while_paused();
            match handler.handle(&event) {
                Ok(outcome) => {
                    log::trace!("Partition {}: {} -> {:?}", index, event, outcome);
                    shared.delivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    log::warn!(
                        "Partition {}: {} failed (attempt {}/{}): {}; redelivering",
                        index,
                        event,
                        attempt,
                        max_attempts,
                        e
                    );
                    shared.redelivered.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    thread::sleep(config.redelivery_backoff);
                }
                Err(e) => {
                    log::error!(
                        "Partition {}: dropping {} after {} attempts: {}",
                        index,
                        event,
                        attempt,
                        e
                    );
                    shared.abandoned.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        shared.finish_one();
    }
    log::trace!("Event consumer {} stopped", index);
}
