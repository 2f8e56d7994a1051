//! Lifecycle event broadcast
//!
//! The notifier keeps one bounded queue per subscriber. Posting never
//! blocks: a subscriber whose queue is full is dropped, which closes its
//! channel, because a gap in the event sequence cannot be repaired later.
//! The store posts while holding its table lock, so every subscriber sees
//! events in table order.

use denc::NotificationEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub struct EventNotifier {
    subscribers: Vec<mpsc::Sender<NotificationEvent>>,
    queue_depth: usize,
}

impl EventNotifier {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Deliver `event` to every live subscriber
    pub fn post(&mut self, event: NotificationEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => {
                trace!("Notified subscriber of {}", event.object_id);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Dropping subscriber: queue of {} events is full",
                    tx.max_capacity()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Removing closed subscriber");
                false
            }
        });
    }

    /// Register a subscriber whose queue starts with `replay`
    pub fn subscribe(&mut self, replay: Vec<NotificationEvent>) -> mpsc::Receiver<NotificationEvent> {
        let (tx, rx) = mpsc::channel(self.queue_depth + replay.len());
        for event in replay {
            // Capacity covers the replay, so this cannot fail
            let _ = tx.try_send(event);
        }
        self.subscribers.push(tx);
        debug!("New subscriber added (total: {})", self.subscribers.len());
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
