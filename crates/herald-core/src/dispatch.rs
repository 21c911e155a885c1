//! The dispatch seam between ingestion adapters and delivery.

use crate::envelope::EventEnvelope;

/// Receives every decoded event, whatever adapter produced it.
///
/// Implementations must return promptly: they hand the event to the
/// delivery layer and never wait on downstream I/O.
pub trait Dispatcher: Send + Sync {
    /// Deliver `envelope` on `channel`.
    fn dispatch(&self, channel: String, envelope: EventEnvelope);
}

impl<F> Dispatcher for F
where
    F: Fn(String, EventEnvelope) + Send + Sync,
{
    fn dispatch(&self, channel: String, envelope: EventEnvelope) {
        self(channel, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_dispatcher() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(move |channel: String, _: EventEnvelope| {
            sink.lock().unwrap().push(channel);
        });

        dispatcher.dispatch("news".into(), EventEnvelope::new("news", "e", Value::Null));
        assert_eq!(*seen.lock().unwrap(), vec!["news".to_string()]);
    }
}
