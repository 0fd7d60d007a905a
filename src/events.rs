//! Publish-subscribe fan-out of engine events to any presentation layer
//! (spec §4.7). Grounded on the `broadcast::Sender` field in
//! `ContextStore` rather than the `Handler`/`HandlerList` trait-object
//! pattern elsewhere in the teacher: `tokio::sync::broadcast` gives a slow
//! subscriber exactly the "drops its oldest pending event, never blocks the
//! producer" semantics the spec calls for, via its own `Lagged` error.

use crate::model::{DeviceState, SessionPhase};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    CountUpdated {
        order_code: String,
        seq: i64,
        quantity: i64,
    },
    ProgressUpdated {
        order_code: String,
        quantity_pending: i64,
        progress_ratio: f64,
    },
    StateChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    DeviceHeartbeat {
        device_id: String,
        snapshot: Option<DeviceSnapshot>,
    },
    DeviceReset {
        device_id: String,
        previous_counter: i64,
        snapshot: Option<DeviceSnapshot>,
    },
    StaleCounterDetected {
        device_id: String,
        counter: i64,
        delta: i64,
    },
    LecturaCompleted {
        device_id: String,
    },
    IncrementRejected {
        seq: i64,
        reason: String,
    },
    SyncStarted,
    SyncCompleted {
        uploaded: usize,
    },
    EngineFailed {
        reason: String,
    },
}

/// Snapshot of device state, published alongside heartbeat/reset events so
/// subscribers never need to reach into the Orchestrator's owned map (§5).
#[derive(Debug, Clone)]
pub struct DeviceSnapshot(pub DeviceState);

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish. A publish with no subscribers is not an error;
    /// callers never need to check the result.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::SyncStarted);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::SyncStarted));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_instead_of_blocking_producer() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            bus.publish(EngineEvent::SyncCompleted { uploaded: i });
        }
        // The producer never blocked above; the subscriber now observes a
        // Lagged error on its next recv rather than the full backlog.
        let result = rx.recv().await;
        assert!(result.is_err());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::SyncStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
