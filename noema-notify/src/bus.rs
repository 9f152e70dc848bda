//! Process-local pub/sub over a single event type, one broadcast channel per kind (§4.H).
//!
//! The bus does not persist anything: a generation's `deliveryStatus` field is the durable
//! delivery log (§4.H), this is purely the fan-out mechanism. Late subscribers miss events
//! emitted before they subscribed, same as any broadcast channel.

use tokio::sync::broadcast;

use noema_events::BusEvent;

const CHANNEL_CAPACITY: usize = 1024;

/// Holds one broadcast sender; every `subscribe()` call gets an independent receiver that
/// sees every event published after it subscribes.
pub struct NotificationBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Returns the number of live subscribers it reached; `0` is not
    /// an error, it just means nobody is listening right now.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::CookProgress {
            cook_id: "c1".into(),
            generated_count: 1,
            target_count: 5,
            cost_usd: "0.01".into(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "cook_progress");
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_events() {
        let bus = NotificationBus::new();
        bus.publish(BusEvent::CookProgress {
            cook_id: "c1".into(),
            generated_count: 1,
            target_count: 5,
            cost_usd: "0.01".into(),
        });
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::CookProgress {
            cook_id: "c2".into(),
            generated_count: 2,
            target_count: 5,
            cost_usd: "0.02".into(),
        });
        let received = rx.recv().await.unwrap();
        match received {
            BusEvent::CookProgress { cook_id, .. } => assert_eq!(cook_id, "c2"),
            _ => panic!("unexpected event"),
        }
    }
}
