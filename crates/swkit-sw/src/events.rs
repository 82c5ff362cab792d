//! In-process state-change notifications.
//!
//! Delivery is best-effort: a subscriber sees every [`WorkerMatch`] published
//! while it is subscribed, nothing from before, and nothing survives a
//! restart. Subscribers that need the full picture should re-read the store.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::WorkerMatch;

/// Receiving side of a subscription. Dropping it unsubscribes.
pub type Subscription = mpsc::UnboundedReceiver<WorkerMatch>;

/// Fan-out of worker state changes.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WorkerMatch>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber. Never blocks.
    pub fn publish(&self, event: WorkerMatch) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(
            id = %event.instance_id,
            state = %event.install_state,
            subscribers = subscribers.len(),
            "Published state change"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<WorkerMatch>>> {
        // A panic while holding this lock cannot leave the list inconsistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
