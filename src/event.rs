use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::retry::OperationError;
use crate::sync_queue::OperationSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// One-shot, user-facing message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    OperationUpdated(OperationSnapshot),
    OperationCompleted(OperationSnapshot),
    /// Published exactly once, when an operation fails permanently.
    OperationFailed {
        operation: OperationSnapshot,
        error: OperationError,
    },
    Notice(Notification),
}

/// Typed fan-out of sync events. Cloning shares the channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("sync event dropped, no subscribers");
        }
    }

    pub fn notify(&self, notification: Notification) {
        self.publish(SyncEvent::Notice(notification));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.notify(Notification::info("Synced", "All changes saved"));

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                SyncEvent::Notice(n) => assert_eq!(n.title, "Synced"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(0);
        bus.notify(Notification::error("x", "y"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
