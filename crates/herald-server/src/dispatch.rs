//! Delivery of ingested events to connections.

use crate::metrics;
use herald_core::{Dispatcher, EventEnvelope, Router};
use std::sync::Arc;
use tracing::trace;

/// Hands every ingested event to the router, skipping the publisher's own
/// connection.
pub struct ServerDispatcher {
    router: Arc<Router>,
    source: &'static str,
}

impl ServerDispatcher {
    /// Create a dispatcher for events coming from `source`.
    #[must_use]
    pub fn new(router: Arc<Router>, source: &'static str) -> Self {
        Self { router, source }
    }
}

impl Dispatcher for ServerDispatcher {
    fn dispatch(&self, channel: String, envelope: EventEnvelope) {
        let EventEnvelope {
            event,
            data,
            origin_connection_id,
            ..
        } = envelope;

        let recipients =
            self.router
                .emit_except(&channel, origin_connection_id.as_deref(), &event, data);
        metrics::record_dispatch(self.source);
        metrics::set_dropped_deliveries(self.router.dropped_deliveries());

        trace!(
            source = self.source,
            channel = %channel,
            event = %event,
            recipients,
            "Dispatched event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::RouterConfig;
    use serde_json::json;

    #[test]
    fn test_origin_excluded() {
        let router = Arc::new(Router::new());
        let mut publisher = router.register("c_1");
        let mut listener = router.register("c_2");
        router.subscribe("c_1", "orders").unwrap();
        router.subscribe("c_2", "orders").unwrap();

        let dispatcher = ServerDispatcher::new(Arc::clone(&router), "http");
        let envelope = EventEnvelope::new("orders", "OrderShipped", json!({ "id": 5 }))
            .with_origin(Some("c_1".to_string()));
        dispatcher.dispatch("orders".to_string(), envelope);

        let delivery = listener.try_recv().unwrap();
        assert_eq!(delivery.channel, "orders");
        assert_eq!(delivery.event, "OrderShipped");
        assert_eq!(delivery.data, json!({ "id": 5 }));
        assert!(publisher.try_recv().is_err());
    }

    #[test]
    fn test_stalled_listener_does_not_block_dispatch() {
        let router = Arc::new(Router::with_config(RouterConfig {
            outbox_capacity: 4,
            ..RouterConfig::default()
        }));
        let mut stalled = router.register("c_1");
        let mut reader = router.register("c_2");
        router.subscribe("c_1", "orders").unwrap();
        router.subscribe("c_2", "orders").unwrap();

        let dispatcher = ServerDispatcher::new(Arc::clone(&router), "redis");
        for n in 0..10 {
            dispatcher.dispatch(
                "orders".to_string(),
                EventEnvelope::new("orders", "Tick", json!(n)),
            );
            assert_eq!(reader.try_recv().unwrap().data, json!(n));
        }

        assert_eq!(router.dropped_deliveries(), 6);
        let mut queued = 0;
        while stalled.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[test]
    fn test_channel_without_subscribers() {
        let router = Arc::new(Router::new());
        let dispatcher = ServerDispatcher::new(Arc::clone(&router), "redis");
        dispatcher.dispatch(
            "empty".to_string(),
            EventEnvelope::new("empty", "e", json!(null)),
        );
        assert!(!router.channel_exists("empty"));
    }
}
