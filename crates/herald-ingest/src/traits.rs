//! Adapter abstraction for Herald.
//!
//! Adapters differ in how events arrive but share one lifecycle:
//! `subscribe` starts feeding a dispatcher, `unsubscribe` stops it.

use async_trait::async_trait;
use herald_core::Dispatcher;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Ingestion errors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// An inbound event failed validation.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The adapter could not start receiving events.
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
}

/// A source of events to broadcast.
#[async_trait]
pub trait IngestAdapter: Send + Sync {
    /// Start feeding events to `dispatcher`.
    ///
    /// Calling this again replaces the dispatcher instead of adding a
    /// second one.
    async fn subscribe(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), IngestError>;

    /// Stop feeding events. Events already dispatched are not recalled.
    async fn unsubscribe(&self) -> Result<(), IngestError>;

    /// Adapter name, for logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether the adapter currently has a dispatcher.
    fn is_subscribed(&self) -> bool;
}

/// The dispatcher an adapter currently feeds, if any.
#[derive(Default)]
pub(crate) struct DispatchSlot {
    current: RwLock<Option<Arc<dyn Dispatcher>>>,
}

impl DispatchSlot {
    pub(crate) fn set(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    pub(crate) fn clear(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn Dispatcher>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::EventEnvelope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_slot_replaces_dispatcher() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let slot = DispatchSlot::default();

        let counter = Arc::clone(&first);
        slot.set(Arc::new(move |_: String, _: EventEnvelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        slot.set(Arc::new(move |_: String, _: EventEnvelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let envelope = EventEnvelope::new("a", "e", serde_json::Value::Null);
        slot.get().unwrap().dispatch("a".into(), envelope);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        slot.clear();
        assert!(slot.get().is_none());
    }
}
