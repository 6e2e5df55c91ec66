//! Fan-out of [`PlayerEvent`]s to any number of listeners.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, unbounded};

pub use avsync_types::PlayerEvent;

/// Broadcasts controller events to subscribers.
///
/// Each subscriber gets its own unbounded channel; dropping the receiver unsubscribes.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: PlayerEvent) {
        tracing::trace!(?event, "player event");
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(PlayerEvent::BufferingProgress { percent: 40 });
        assert_eq!(a.try_recv().unwrap(), PlayerEvent::BufferingProgress { percent: 40 });
        assert_eq!(b.try_recv().unwrap(), PlayerEvent::BufferingProgress { percent: 40 });
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(PlayerEvent::LoopCompleted { count: 1 });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new();
        bus.publish(PlayerEvent::Finished { error: None });
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
