//! Best-effort cancellation signals for in-flight comparisons.
//!
//! Publishing is fire-and-forget: every live subscription receives the key
//! and nothing waits for a subscriber to act on it. A subscription leaves the
//! registry when it is dropped.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::scanner::FileId;

/// What a cancellation signal refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CancelKey {
    /// A file name that was removed
    Path(PathBuf),
    /// An identity whose last name was removed
    File(FileId),
}

type Subscribers = Mutex<SubscriberList>;

#[derive(Debug, Default)]
struct SubscriberList {
    next_id: u64,
    senders: Vec<(u64, Sender<CancelKey>)>,
}

/// Publish/subscribe hub for [`CancelKey`]s.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    subscribers: Arc<Subscribers>,
}

impl CancellationRegistry {
    /// Create a registry with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving every key published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let mut list = self.subscribers.lock();
        let id = list.next_id;
        list.next_id += 1;
        list.senders.push((id, tx));
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Send `key` to every live subscriber. Returns how many received it.
    pub fn publish(&self, key: CancelKey) -> usize {
        let mut list = self.subscribers.lock();
        list.senders.retain(|(_, tx)| tx.send(key.clone()).is_ok());
        log::trace!("Published cancellation {:?} to {}", key, list.senders.len());
        list.senders.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().senders.len()
    }
}

/// Receiving end of a registry subscription.
///
/// Unregisters itself on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Receiver<CancelKey>,
    registry: Weak<Subscribers>,
}

impl Subscription {
    /// Take every key received so far without blocking.
    #[must_use]
    pub fn drain(&self) -> Vec<CancelKey> {
        self.rx.try_iter().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.registry.upgrade() {
            subscribers.lock().senders.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives() {
        let registry = CancellationRegistry::new();
        let a = registry.subscribe();
        let b = registry.subscribe();

        assert_eq!(registry.publish(CancelKey::File(FileId(3))), 2);
        assert_eq!(a.drain(), vec![CancelKey::File(FileId(3))]);
        assert_eq!(b.drain(), vec![CancelKey::File(FileId(3))]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_keys_before_subscribe_are_not_seen() {
        let registry = CancellationRegistry::new();
        registry.publish(CancelKey::Path(PathBuf::from("/a")));
        let sub = registry.subscribe();
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_dropped_subscription_unregisters() {
        let registry = CancellationRegistry::new();
        let kept = registry.subscribe();
        drop(registry.subscribe());
        assert_eq!(registry.subscriber_count(), 1);

        assert_eq!(registry.publish(CancelKey::Path(PathBuf::from("/a"))), 1);
        assert_eq!(kept.drain().len(), 1);
        drop(kept);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_many_short_subscriptions_leave_nothing_behind() {
        let registry = CancellationRegistry::new();
        for _ in 0..1000 {
            let sub = registry.subscribe();
            assert!(sub.drain().is_empty());
        }
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let registry = CancellationRegistry::new();
        let sub = registry.subscribe();
        drop(registry);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let registry = CancellationRegistry::new();
        assert_eq!(registry.publish(CancelKey::File(FileId(1))), 0);
    }
}
