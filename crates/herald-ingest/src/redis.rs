//! Redis pub/sub adapter.
//!
//! Subscribes to `<key_prefix>*` and treats every message as an event for
//! the channel named by the rest of the topic. Payloads look like
//! `{"event": "OrderShipped", "data": {...}, "socket": "c_12"}`; anything
//! else is dropped, since the bus has no way to report an error back.

use crate::traits::{DispatchSlot, IngestAdapter, IngestError};
use ::redis::aio::PubSub;
use ::redis::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use herald_core::{Dispatcher, EventEnvelope};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Redis adapter configuration.
#[derive(Debug, Clone)]
pub struct RedisAdapterConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix stripped from topics to recover channel names.
    pub key_prefix: String,
    /// Delay before reconnecting after the connection drops.
    pub reconnect_delay: Duration,
    /// Log every event at info level.
    pub dev_mode: bool,
}

impl Default for RedisAdapterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            reconnect_delay: Duration::from_millis(1000),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BusMessage {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    socket: Option<String>,
}

/// Decode one bus message into its channel and envelope.
///
/// Returns `None` for payloads that are not an event.
#[must_use]
pub fn decode_bus_message(
    topic: &str,
    key_prefix: &str,
    payload: &str,
) -> Option<(String, EventEnvelope)> {
    let message: BusMessage = serde_json::from_str(payload).ok()?;
    let channel = topic.strip_prefix(key_prefix).unwrap_or(topic);
    if channel.is_empty() {
        return None;
    }

    let envelope =
        EventEnvelope::new(channel, message.event, message.data).with_origin(message.socket);
    Some((channel.to_string(), envelope))
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Bus listener for events published on Redis.
pub struct RedisAdapter {
    config: RedisAdapterConfig,
    slot: Arc<DispatchSlot>,
    listener: Mutex<Option<Listener>>,
}

impl RedisAdapter {
    #[must_use]
    pub fn new(config: RedisAdapterConfig) -> Self {
        Self {
            config,
            slot: Arc::default(),
            listener: Mutex::new(None),
        }
    }

    fn pattern(&self) -> String {
        format!("{}*", self.config.key_prefix)
    }
}

async fn connect(url: &str, pattern: &str) -> Result<PubSub, ::redis::RedisError> {
    let client = Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    Ok(pubsub)
}

#[async_trait]
impl IngestAdapter for RedisAdapter {
    async fn subscribe(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), IngestError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            self.slot.set(dispatcher);
            debug!("Redis listener already running, dispatcher replaced");
            return Ok(());
        }

        let pattern = self.pattern();
        let pubsub = connect(&self.config.url, &pattern).await.map_err(|e| {
            error!(error = %e, pattern = %pattern, "Redis could not subscribe");
            IngestError::SubscribeFailed(format!("Redis could not subscribe to {pattern}: {e}"))
        })?;

        self.slot.set(dispatcher);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(listen(
            pubsub,
            self.config.clone(),
            Arc::clone(&self.slot),
            shutdown_rx,
        ));
        *listener = Some(Listener { shutdown, handle });

        info!(pattern = %pattern, "Listening for redis events...");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), IngestError> {
        self.slot.clear();

        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };

        let _ = listener.shutdown.send(());
        if let Err(e) = listener.handle.await {
            warn!(error = %e, "Redis listener task ended abnormally");
        }

        info!("Stopped listening for redis events");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_subscribed(&self) -> bool {
        self.slot.get().is_some()
    }
}

/// Receive messages until shut down, reconnecting when the connection drops.
async fn listen(
    pubsub: PubSub,
    config: RedisAdapterConfig,
    slot: Arc<DispatchSlot>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let pattern = format!("{}*", config.key_prefix);
    let mut pubsub = Some(pubsub);

    loop {
        let current = match pubsub.take() {
            Some(current) => current,
            None => {
                tokio::select! {
                    _ = &mut shutdown => return,
                    () = tokio::time::sleep(config.reconnect_delay) => {}
                }
                match connect(&config.url, &pattern).await {
                    Ok(reconnected) => {
                        info!(pattern = %pattern, "Reconnected to redis");
                        reconnected
                    }
                    Err(e) => {
                        error!(error = %e, "Redis reconnect failed");
                        continue;
                    }
                }
            }
        };

        let mut messages = current.into_on_message();
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!("Redis pub/sub stream ended, reconnecting");
                        break;
                    };

                    let topic = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!(topic = %topic, error = %e, "Non-text redis payload dropped");
                            continue;
                        }
                    };

                    let Some((channel, envelope)) = decode_bus_message(&topic, &config.key_prefix, &payload) else {
                        if config.dev_mode {
                            info!(topic = %topic, "No JSON message");
                        } else {
                            debug!(topic = %topic, "Undecodable redis message dropped");
                        }
                        continue;
                    };

                    if config.dev_mode {
                        info!(channel = %channel, event = %envelope.event, "Redis event");
                    } else {
                        trace!(channel = %channel, event = %envelope.event, "Redis event");
                    }

                    if let Some(dispatcher) = slot.get() {
                        dispatcher.dispatch(channel, envelope);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefix_stripped() {
        let (channel, envelope) = decode_bus_message(
            "laravel_database_private-orders",
            "laravel_database_",
            r#"{"event":"OrderShipped","data":{"id":5},"socket":null}"#,
        )
        .unwrap();

        assert_eq!(channel, "private-orders");
        assert_eq!(envelope.channels, vec!["private-orders".to_string()]);
        assert_eq!(envelope.event, "OrderShipped");
        assert_eq!(envelope.data, json!({ "id": 5 }));
        assert!(envelope.origin_connection_id.is_none());
    }

    #[test]
    fn test_socket_becomes_origin() {
        let (_, envelope) =
            decode_bus_message("news", "", r#"{"event":"Flash","data":[],"socket":"c_3"}"#).unwrap();
        assert_eq!(envelope.origin_connection_id.as_deref(), Some("c_3"));
    }

    #[test]
    fn test_malformed_payload_dropped() {
        assert!(decode_bus_message("news", "", "not json").is_none());
        assert!(decode_bus_message("news", "", r#"{"data":1}"#).is_none());
        assert!(decode_bus_message("prefix_", "prefix_", r#"{"event":"e"}"#).is_none());
    }

    #[test]
    fn test_config_default() {
        let config = RedisAdapterConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert!(config.key_prefix.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_subscribe() {
        let adapter = RedisAdapter::new(RedisAdapterConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        });

        let result = adapter
            .subscribe(Arc::new(|_: String, _: EventEnvelope| {}))
            .await;

        assert!(matches!(result, Err(IngestError::SubscribeFailed(_))));
        assert!(!adapter.is_subscribed());
        adapter.unsubscribe().await.unwrap();
    }
}
