//! Decoded inbound events.
//!
//! An envelope is built by an ingestion adapter, handed to the dispatcher
//! once per target channel, and then dropped. It is never stored.

use crate::channel::ChannelId;
use serde_json::Value;

/// A decoded event ready for dispatch, independent of where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Target channels. Never empty.
    pub channels: Vec<ChannelId>,
    /// Event name.
    pub event: String,
    /// Application payload.
    pub data: Value,
    /// Connection excluded from delivery, if the publisher supplied one.
    pub origin_connection_id: Option<String>,
}

impl EventEnvelope {
    /// Create an envelope for a single channel.
    #[must_use]
    pub fn new(channel: impl Into<ChannelId>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channels: vec![channel.into()],
            event: event.into(),
            data,
            origin_connection_id: None,
        }
    }

    /// Create an envelope for several channels.
    ///
    /// Returns `None` if `channels` is empty.
    #[must_use]
    pub fn for_channels(
        channels: Vec<ChannelId>,
        event: impl Into<String>,
        data: Value,
    ) -> Option<Self> {
        if channels.is_empty() {
            return None;
        }
        Some(Self {
            channels,
            event: event.into(),
            data,
            origin_connection_id: None,
        })
    }

    /// Exclude a connection from delivery.
    #[must_use]
    pub fn with_origin(mut self, connection_id: Option<String>) -> Self {
        self.origin_connection_id = connection_id.filter(|id| !id.is_empty());
        self
    }

    /// Split into one single-channel envelope per target, in order.
    #[must_use]
    pub fn split(self) -> Vec<(ChannelId, EventEnvelope)> {
        let Self {
            channels,
            event,
            data,
            origin_connection_id,
        } = self;

        channels
            .into_iter()
            .map(|channel| {
                let envelope = EventEnvelope {
                    channels: vec![channel.clone()],
                    event: event.clone(),
                    data: data.clone(),
                    origin_connection_id: origin_connection_id.clone(),
                };
                (channel, envelope)
            })
            .collect()
    }
}

/// Decode a JSON-text payload one level deeper.
///
/// Strings that are not valid JSON are passed through unchanged.
#[must_use]
pub fn decode_payload(data: Value) -> Value {
    match data {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            decode_payload(json!(r#"{"order":5}"#)),
            json!({ "order": 5 })
        );
        assert_eq!(decode_payload(json!("not json")), json!("not json"));
        assert_eq!(decode_payload(json!({ "a": 1 })), json!({ "a": 1 }));
    }

    #[test]
    fn test_for_channels_rejects_empty() {
        assert!(EventEnvelope::for_channels(vec![], "e", Value::Null).is_none());
    }

    #[test]
    fn test_split_keeps_event_and_origin() {
        let envelope = EventEnvelope::for_channels(
            vec!["a".into(), "b".into()],
            "Shipped",
            json!({ "id": 1 }),
        )
        .unwrap()
        .with_origin(Some("conn-9".into()));

        let parts = envelope.split();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "a");
        assert_eq!(parts[1].1.channels, vec!["b".to_string()]);
        assert_eq!(parts[1].1.origin_connection_id.as_deref(), Some("conn-9"));
        assert_eq!(parts[0].1.data, parts[1].1.data);
    }

    #[test]
    fn test_empty_origin_ignored() {
        let envelope = EventEnvelope::new("a", "e", Value::Null).with_origin(Some(String::new()));
        assert!(envelope.origin_connection_id.is_none());
    }
}
