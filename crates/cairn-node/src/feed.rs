//! Broadcast of applied reference updates.

use cairn_git::RefUpdate;
use tokio::sync::broadcast;

/// Default number of updates buffered for slow subscribers.
const DEFAULT_CAPACITY: usize = 1024;

/// Publishes every reference change a push applies.
///
/// Subscribers that fall more than the channel capacity behind observe
/// `RecvError::Lagged` and skip ahead; publishing never blocks a push.
#[derive(Debug, Clone)]
pub struct RefUpdateFeed {
    sender: broadcast::Sender<RefUpdate>,
}

impl Default for RefUpdateFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RefUpdateFeed {
    /// Creates a feed buffering up to `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future updates.
    pub fn subscribe(&self) -> broadcast::Receiver<RefUpdate> {
        self.sender.subscribe()
    }

    /// Publishes updates, returning how many subscribers were listening.
    pub fn publish(&self, updates: impl IntoIterator<Item = RefUpdate>) -> usize {
        let mut receivers = 0;
        for update in updates {
            // No subscribers is not an error.
            receivers = self.sender.send(update).unwrap_or(0);
        }
        receivers
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
