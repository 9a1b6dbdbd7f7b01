//! Location source backed by a watch channel.

use proximity_storage::Coordinates;
use tokio::sync::watch;

/// Receiver side consumed by the session manager
pub type LocationReceiver = watch::Receiver<Option<Coordinates>>;

/// Publishes the device's current position
#[derive(Debug, Clone)]
pub struct LocationFeed {
    tx: watch::Sender<Option<Coordinates>>,
}

impl LocationFeed {
    /// Create a feed with no position yet
    pub fn new() -> (Self, LocationReceiver) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Publish a new position
    pub fn publish(&self, position: Coordinates) {
        self.tx.send_replace(Some(position));
    }

    /// Last published position
    pub fn current(&self) -> Option<Coordinates> {
        *self.tx.borrow()
    }

    /// Additional receiver
    pub fn subscribe(&self) -> LocationReceiver {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_wakes_receiver() {
        let (feed, mut rx) = LocationFeed::new();
        assert!(feed.current().is_none());

        feed.publish(Coordinates::new(1.0, 2.0));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(Coordinates::new(1.0, 2.0)));
    }
}
