//! The daemon's event bus: a broadcast channel with a monotonic sequence
//! number, so any outer surface (UI, logging sink, a future HTTP/WebSocket
//! layer) can subscribe independently and tell events apart by arrival
//! order. Grounded on `ochra-daemon/src/events.rs`, trimmed to this
//! gateway's event set (no category/severity filtering — there is exactly
//! one subscriber kind here, not a UI-facing filtered subscription API).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event emitted by the daemon, for consumption by whatever outer surface
/// wires up a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub event_type: String,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
}

/// Broadcasts [`Event`]s to any number of subscribers, each with its own
/// lagging-aware receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp `event_type`/`payload` with the next sequence number and
    /// timestamp, and broadcast. Ignores the "no subscribers" send error.
    pub fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            sequence,
            event_type: event_type.to_string(),
            timestamp_ms: rrc_protocol::envelope::now_ms(),
            payload,
        };
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_increments_sequence_and_delivers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit("Welcomed", serde_json::json!({}));
        let event = rx.try_recv().expect("receive event");
        assert_eq!(event.event_type, "Welcomed");
        assert_eq!(event.sequence, 1);
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn sequence_keeps_incrementing_without_subscribers() {
        let bus = EventBus::new(16);
        bus.emit("A", serde_json::json!(null));
        bus.emit("B", serde_json::json!(null));
        assert_eq!(bus.sequence(), 2);
    }

    #[tokio::test]
    async fn independent_subscribers_each_see_every_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.emit("Joined", serde_json::json!({"room": "general"}));

        assert_eq!(rx1.recv().await.unwrap().event_type, "Joined");
        assert_eq!(rx2.recv().await.unwrap().event_type, "Joined");
    }
}
