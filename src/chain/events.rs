use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::chain::model::{ChainId, ChainStatus};

/// A status transition of one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain_id: ChainId,
    pub name: String,
    /// `None` for the registration event
    pub from: Option<ChainStatus>,
    pub to: ChainStatus,
    pub at: DateTime<Utc>,
}

impl ChainEvent {
    pub fn new(
        chain_id: impl Into<ChainId>,
        name: impl Into<String>,
        from: Option<ChainStatus>,
        to: ChainStatus,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            name: name.into(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// Lifecycle event fan-out. Publishing never blocks: slow subscribers lose
/// the oldest events.
pub struct EventBus {
    tx: Sender<ChainEvent>,
    keepalive: InactiveReceiver<ChainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true); // Drop oldest messages when full
        tx.set_await_active(false);
        Self {
            tx,
            keepalive: rx.deactivate(),
        }
    }

    pub fn publish(&self, event: ChainEvent) {
        match self.tx.try_broadcast(event) {
            Ok(_) => {}
            Err(TrySendError::Inactive(_)) => {}
            Err(e) => trace!(error = %e, "Dropped chain event"),
        }
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        self.keepalive.activate_cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(ChainEvent::new("c1", "load", None, ChainStatus::Pending));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ChainEvent::new("c1", "load", None, ChainStatus::Pending));
        bus.publish(ChainEvent::new(
            "c1",
            "load",
            Some(ChainStatus::Pending),
            ChainStatus::Running,
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.to, ChainStatus::Pending);
        assert_eq!(second.from, Some(ChainStatus::Pending));
        assert_eq!(second.to, ChainStatus::Running);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for to in [ChainStatus::Pending, ChainStatus::Running, ChainStatus::Success] {
            bus.publish(ChainEvent::new("c1", "load", None, to));
        }
        // First event was pushed out by the third
        let mut received = Vec::new();
        let mut overflowed = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => received.push(event.to),
                Err(async_broadcast::TryRecvError::Overflowed(n)) => overflowed += n,
                Err(_) => break,
            }
        }
        assert_eq!(overflowed, 1);
        assert_eq!(received, vec![ChainStatus::Running, ChainStatus::Success]);
    }
}
