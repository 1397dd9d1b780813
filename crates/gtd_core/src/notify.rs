//! Notifications for observers of the replica.
//!
//! Observers (a UI, the CLI waiting for a sync round) subscribe and get a
//! `Receiver` that sees every notification emitted after subscription:
//!
//! ```rust
//! use gtd_core::{Notification, NotificationFeed};
//!
//! let feed = NotificationFeed::new();
//! let rx = feed.subscribe();
//!
//! feed.emit(Notification::StateChanged);
//! assert_eq!(rx.recv().unwrap(), Notification::StateChanged);
//! ```

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// An event observers can react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A command batch was applied to the document.
    StateChanged,
    /// A sync round failed.
    SyncError(String),
}

/// Fans notifications out to subscribers.
///
/// - Preserves emission order per subscriber
/// - Drops subscribers whose receiver is gone
/// - Thread-safe
#[derive(Debug, Default)]
pub struct NotificationFeed {
    subscribers: RwLock<Vec<Sender<Notification>>>,
}

impl NotificationFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends a notification to every live subscriber.
    pub fn emit(&self, notification: Notification) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers as of the last emit.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_every_notification() {
        let feed = NotificationFeed::new();
        let a = feed.subscribe();
        let b = feed.subscribe();

        feed.emit(Notification::StateChanged);
        feed.emit(Notification::SyncError("timed out".into()));

        for rx in [a, b] {
            assert_eq!(rx.recv().unwrap(), Notification::StateChanged);
            assert_eq!(
                rx.recv().unwrap(),
                Notification::SyncError("timed out".into())
            );
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = NotificationFeed::new();
        let kept = feed.subscribe();
        drop(feed.subscribe());
        assert_eq!(feed.subscriber_count(), 2);

        feed.emit(Notification::StateChanged);
        assert_eq!(feed.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
