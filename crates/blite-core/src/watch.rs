//! Post-commit change fan-out.
//!
//! Each subscription owns a bounded single-producer/single-consumer queue.
//! The committer performs a non-blocking enqueue on every live queue of
//! the affected collection: a slow subscriber only backs up its own queue,
//! and a full queue drops the event and bumps that subscriber's drop
//! counter, surfaced as `missed` on the next event that does get through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use blite_bson::BsonValue;
use blite_txn::{ChangeOp, PendingChange};
use blite_types::DocumentLocation;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

/// Queue capacity per subscriber.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One delivered change event.
#[derive(Debug, Clone)]
pub struct Change {
    pub op: ChangeOp,
    pub doc_id: BsonValue,
    /// Encoded document bytes after the change; `None` for deletes.
    pub after: Option<Arc<Vec<u8>>>,
    pub location: DocumentLocation,
    /// Events this subscriber lost to a full queue since its last
    /// successful delivery.
    pub missed: u64,
}

struct SubscriberHandle {
    sender: SyncSender<Change>,
    dropped: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
}

impl SubscriberHandle {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Receiving end of a subscription. Dropping it (or calling
/// [`Subscription::cancel`]) detaches the queue from the dispatcher.
pub struct Subscription {
    receiver: Receiver<Change>,
    dropped: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
}

impl Subscription {
    /// Block until the next event, or `None` once cancelled and drained.
    #[must_use]
    pub fn receive(&self) -> Option<Change> {
        self.receiver.recv().ok()
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn try_receive(&self) -> Option<Change> {
        self.receiver.try_recv().ok()
    }

    /// Events lost to backpressure and not yet surfaced via `missed`.
    #[must_use]
    pub fn pending_drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the dispatcher. Queued events remain readable.
    pub fn cancel(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-collection subscriber registry.
#[derive(Default)]
pub struct ChangeDispatcher {
    subs: RwLock<HashMap<String, Vec<SubscriberHandle>>>,
}

impl ChangeDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription on `collection` with the default queue bound.
    #[must_use]
    pub fn subscribe(&self, collection: &str) -> Subscription {
        self.subscribe_with_capacity(collection, DEFAULT_QUEUE_CAPACITY)
    }

    /// Open a subscription with an explicit queue bound.
    #[must_use]
    pub fn subscribe_with_capacity(&self, collection: &str, capacity: usize) -> Subscription {
        let (sender, receiver) = sync_channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(AtomicBool::new(true));
        self.subs
            .write()
            .entry(collection.to_owned())
            .or_default()
            .push(SubscriberHandle {
                sender,
                dropped: Arc::clone(&dropped),
                alive: Arc::clone(&alive),
            });
        Subscription {
            receiver,
            dropped,
            alive,
        }
    }

    /// Number of live subscribers for `collection`.
    #[must_use]
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.subs
            .read()
            .get(collection)
            .map_or(0, |handles| handles.iter().filter(|h| h.is_live()).count())
    }

    /// Fan out the changes of one durable commit, in commit order.
    /// Never blocks: a full queue drops the event for that subscriber only.
    pub fn dispatch(&self, changes: &[PendingChange]) {
        if changes.is_empty() {
            return;
        }
        let mut subs = self.subs.write();
        for change in changes {
            let Some(handles) = subs.get_mut(&change.collection) else {
                continue;
            };
            handles.retain(|handle| {
                if !handle.is_live() {
                    return false;
                }
                let missed = handle.dropped.swap(0, Ordering::Relaxed);
                let event = Change {
                    op: change.op,
                    doc_id: change.doc_id.clone(),
                    after: change.after.clone(),
                    location: change.location,
                    missed,
                };
                match handle.sender.try_send(event) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        // Restore the count we optimistically claimed, plus
                        // this event.
                        handle.dropped.fetch_add(missed + 1, Ordering::Relaxed);
                        warn!(collection = %change.collection, "subscriber queue full; event dropped");
                        true
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                }
            });
        }
    }
}
