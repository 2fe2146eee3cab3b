use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::relay::errors::SubscriberSendFailure;
use crate::relay::models::SubscriberId;
use crate::relay::outbound_queue::{OutboundSender, Payload};

/// A connected consumer of published snapshots.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    outbound: OutboundSender,
    connected_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue a payload for this subscriber without waiting on its socket.
    pub fn send(&self, payload: Payload) -> Result<(), SubscriberSendFailure> {
        self.outbound.send(payload)
    }
}

/// Set of currently connected subscribers.
///
/// The lock is only held to insert, remove, or clone the list of entries, so
/// connect/disconnect churn never waits on a broadcast in progress.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a subscriber fed through `channel` and return its new id.
    pub fn register(&self, channel: OutboundSender) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber {
            id,
            outbound: channel,
            connected_at: Utc::now(),
        });

        self.subscribers.write().insert(id, subscriber);
        tracing::debug!("Registered subscriber: '{}'", id);
        id
    }

    /// Remove a subscriber if present. Safe to call more than once for the same id.
    ///
    /// # Returns
    /// * `true` if this call removed the subscriber
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);

        match removed {
            Some(subscriber) => {
                subscriber.outbound.close();
                tracing::debug!(
                    "Unregistered subscriber: '{}', connected at: '{}', dropped messages: '{}'",
                    id,
                    subscriber.connected_at().to_rfc3339(),
                    subscriber.outbound.dropped()
                );
                true
            }
            None => {
                tracing::trace!("Subscriber '{}' already unregistered", id);
                false
            }
        }
    }

    /// Invoke `f` for every subscriber registered at the time of the call.
    ///
    /// Iteration runs over a copy of the entry list taken under the read lock,
    /// so `f` may itself register or unregister subscribers.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Subscriber),
    {
        for subscriber in self.snapshot() {
            f(&subscriber);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().values().cloned().collect()
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
