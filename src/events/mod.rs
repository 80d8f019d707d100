//! Single-writer event fanout with bounded per-subscriber mailboxes.
//!
//! Slow consumers lose events: the broadcaster drops on a full mailbox
//! instead of blocking the mutating request that produced the event.
//! Clients reconcile through periodic full-tree refreshes, so gaps are
//! tolerated by contract.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::protocol::EventRecord;

/// Capacity of each subscriber mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    sender: async_channel::Sender<EventRecord>,
}

/// Fanout hub owned by the server state.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// A live subscription; dropping it detaches the mailbox.
pub struct Subscription {
    pub id: u64,
    receiver: async_channel::Receiver<EventRecord>,
}

impl Subscription {
    /// Waits for the next event; `None` once the broadcaster is gone.
    pub async fn recv(&self) -> Option<EventRecord> {
        self.receiver.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<EventRecord> {
        self.receiver.try_recv().ok()
    }

    pub fn into_receiver(self) -> async_channel::Receiver<EventRecord> {
        self.receiver
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(MAILBOX_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), capacity }
    }

    /// Registers a new mailbox.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = async_channel::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Subscriber { id, sender });
        debug!(subscriber = id, "event subscriber attached");
        Subscription { id, receiver }
    }

    /// Delivers `event` to every live mailbox, dropping on full ones and
    /// pruning closed ones.
    pub fn publish(&self, event: &EventRecord) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(async_channel::TrySendError::Full(_)) => {
                trace!(subscriber = sub.id, path = %event.path, "mailbox full, event dropped");
                true
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "event subscriber detached");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
