//! Fan-out hub for bus events.
//!
//! Singleton per process, injected through `AppState` with an explicit
//! shutdown. Events are scoped to the owning user; ordering holds per
//! emitter, not across emitters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{BusEvent, SubscriptionFilters};

/// Per-connection send buffer. A slow consumer drops events rather than
/// stalling emitters (at-most-once delivery).
const CONNECTION_BUFFER_SIZE: usize = 64;

struct Connection {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
    filters: SubscriptionFilters,
}

/// Event bus hub managing subscriber connections per user.
pub struct EventBus {
    connections: DashMap<String, Vec<Connection>>,
    next_conn_id: AtomicU64,
    shut_down: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a subscriber for a user. Returns the event receiver and the
    /// connection id for unregistering.
    pub fn register(
        &self,
        user_id: &str,
        filters: SubscriptionFilters,
    ) -> (mpsc::Receiver<BusEvent>, u64) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .push(Connection { id: conn_id, tx, filters });
        debug!(user_id, conn_id, "event bus subscriber registered");
        (rx, conn_id)
    }

    pub fn unregister(&self, user_id: &str, conn_id: u64) {
        if let Some(mut conns) = self.connections.get_mut(user_id) {
            conns.retain(|c| c.id != conn_id);
        }
        self.connections.retain(|_, v| !v.is_empty());
        debug!(user_id, conn_id, "event bus subscriber unregistered");
    }

    /// Publish an event to all of a user's subscribers whose filters match.
    ///
    /// Nonblocking: a full connection buffer loses the event for that
    /// connection only.
    pub fn publish(&self, user_id: &str, event: BusEvent) {
        if self.shut_down.load(Ordering::Relaxed) {
            return;
        }
        if let Some(conns) = self.connections.get(user_id) {
            for conn in conns.iter() {
                if !conn.filters.matches(&event) {
                    continue;
                }
                if conn.tx.try_send(event.clone()).is_err() {
                    warn!(
                        user_id,
                        conn_id = conn.id,
                        kind = %event.kind,
                        "dropping bus event for slow subscriber"
                    );
                }
            }
        }
    }

    /// Drop all subscribers and refuse further publishes.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
        self.connections.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
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
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = EventBus::new();
        let (mut rx, _id) = bus.register("u1", SubscriptionFilters::default());

        bus.publish("u1", BusEvent::session("running", "ses_1", json!({})));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "session.running");
        assert_eq!(event.subject, "ses_1");
    }

    #[tokio::test]
    async fn events_are_user_scoped() {
        let bus = EventBus::new();
        let (mut rx_other, _) = bus.register("u2", SubscriptionFilters::default());

        bus.publish("u1", BusEvent::session("idle", "ses_1", json!({})));
        bus.publish("u2", BusEvent::session("idle", "ses_9", json!({})));

        let event = rx_other.recv().await.unwrap();
        assert_eq!(event.subject, "ses_9");
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let bus = EventBus::new();
        let (mut rx, conn_id) = bus.register("u1", SubscriptionFilters::default());
        bus.unregister("u1", conn_id);
        bus.publish("u1", BusEvent::session("idle", "ses_1", json!({})));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_silences_the_bus() {
        let bus = EventBus::new();
        let (mut rx, _) = bus.register("u1", SubscriptionFilters::default());
        bus.shutdown();
        bus.publish("u1", BusEvent::session("idle", "ses_1", json!({})));
        assert!(rx.recv().await.is_none());
    }
}
