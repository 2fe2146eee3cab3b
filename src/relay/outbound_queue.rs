//! Bounded per-subscriber outbound queue.
//!
//! The hub pushes serialized payloads without waiting on the network; a
//! transport task drains the queue into the subscriber's socket. When a slow
//! subscriber fills its queue the configured `OverflowPolicy` decides whether
//! the oldest message is dropped or the subscriber is cut off.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::relay::errors::SubscriberSendFailure;

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest queued message to make room.
    DropOldest,
    /// Close the queue; the subscriber gets unregistered.
    Disconnect,
}

/// Shared payload; one serialization is handed to every subscriber.
pub type Payload = Arc<str>;

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<Payload>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
}

impl Shared {
    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Create a queue holding at most `capacity` undelivered payloads.
pub fn outbound_queue(capacity: usize, policy: OverflowPolicy) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            messages: VecDeque::with_capacity(capacity),
            closed: false,
            dropped: 0,
        }),
        capacity: capacity.max(1),
        policy,
        notify: Notify::new(),
    });

    (
        OutboundSender { shared: Arc::clone(&shared) },
        OutboundReceiver { shared },
    )
}

/// Producer half, owned by the subscriber's registry entry. Dropping it
/// closes the queue once the remaining payloads are drained.
#[derive(Debug)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Enqueue a payload without blocking.
    ///
    /// # Returns
    /// * `Err(SubscriberSendFailure::Closed)` if the receiver is gone or the queue was closed earlier
    /// * `Err(SubscriberSendFailure::Overflow)` if the queue was full under `OverflowPolicy::Disconnect`
    pub fn send(&self, payload: Payload) -> Result<(), SubscriberSendFailure> {
        let mut state = self.shared.state.lock();

        if state.closed {
            return Err(SubscriberSendFailure::Closed);
        }

        if state.messages.len() >= self.shared.capacity {
            match self.shared.policy {
                OverflowPolicy::DropOldest => {
                    state.messages.pop_front();
                    state.dropped += 1;
                }
                OverflowPolicy::Disconnect => {
                    state.messages.clear();
                    state.closed = true;
                    drop(state);
                    self.shared.notify.notify_one();
                    return Err(SubscriberSendFailure::Overflow);
                }
            }
        }

        state.messages.push_back(payload);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn close(&self) {
        self.shared.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of payloads waiting to be delivered.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    /// Payloads discarded by `OverflowPolicy::DropOldest` so far.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl Drop for OutboundSender {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consumer half, owned by the transport task writing to the subscriber.
#[derive(Debug)]
pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Wait for the next payload. Returns `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<Payload> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(payload) = state.messages.pop_front() {
                    return Some(payload);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
