//! Connection registry and event router for Herald.
//!
//! The router tracks every live connection, the rooms each one has joined,
//! and emits events into connection outboxes. It is also the presence
//! directory's source of truth for which connections are alive.

use crate::channel::{
    hand_off, validate_channel_name, Channel, ChannelId, Delivery, Handoff, Inbox, Outbox,
};
use crate::presence::{ConnectionOracle, OracleError, PresenceNotifier};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The connection was never registered or is already gone.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Already subscribed to channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Deliveries a connection may have queued before new ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
            outbox_capacity: 1024,
        }
    }
}

struct ConnectionEntry {
    outbox: Outbox,
    channels: HashSet<ChannelId>,
}

/// The central router.
///
/// Channels are created on first subscribe and removed when their last
/// subscriber leaves. No method holds locks on both maps at once.
pub struct Router {
    channels: DashMap<ChannelId, Channel>,
    connections: DashMap<String, ConnectionEntry>,
    dropped: AtomicU64,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            connections: DashMap::new(),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            channel_count: self.channels.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|c| c.channels.len()).sum(),
            dropped_deliveries: self.dropped_deliveries(),
        }
    }

    /// Deliveries dropped because a connection's outbox was full.
    #[must_use]
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Register a live connection and return the receiving half of its outbox.
    pub fn register(&self, connection_id: &str) -> Inbox {
        let (outbox, inbox) = mpsc::channel(self.config.outbox_capacity.max(1));
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                outbox,
                channels: HashSet::new(),
            },
        );
        debug!(connection = %connection_id, "Connection registered");
        inbox
    }

    /// Drop a connection and remove it from every room.
    ///
    /// Returns the channels it was still subscribed to.
    pub fn unregister(&self, connection_id: &str) -> Vec<ChannelId> {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return Vec::new();
        };

        let channels: Vec<ChannelId> = entry.channels.into_iter().collect();
        for channel_name in &channels {
            self.leave_room(connection_id, channel_name);
        }

        debug!(connection = %connection_id, channels = channels.len(), "Connection unregistered");
        channels
    }

    /// Subscribe a connection to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid, the connection is
    /// unknown or already subscribed, or a limit is exceeded.
    pub fn subscribe(&self, connection_id: &str, channel_name: &str) -> Result<(), RouterError> {
        validate_channel_name(channel_name).map_err(RouterError::InvalidChannel)?;

        let outbox = {
            let conn = self
                .connections
                .get(connection_id)
                .ok_or_else(|| RouterError::UnknownConnection(connection_id.to_string()))?;

            if conn.channels.contains(channel_name) {
                return Err(RouterError::AlreadySubscribed(channel_name.to_string()));
            }
            if conn.channels.len() >= self.config.max_subscriptions_per_connection {
                return Err(RouterError::MaxSubscriptionsReached);
            }
            conn.outbox.clone()
        };

        if !self.channels.contains_key(channel_name)
            && self.channels.len() >= self.config.max_channels
        {
            return Err(RouterError::MaxChannelsReached);
        }

        {
            let mut channel = self
                .channels
                .entry(channel_name.to_string())
                .or_insert_with(|| {
                    debug!(channel = %channel_name, "Creating new channel");
                    Channel::new(channel_name)
                });
            channel.subscribe(connection_id, outbox);
        }

        match self.connections.get_mut(connection_id) {
            Some(mut conn) => {
                conn.channels.insert(channel_name.to_string());
                Ok(())
            }
            None => {
                // Unregistered while subscribing.
                self.leave_room(connection_id, channel_name);
                Err(RouterError::UnknownConnection(connection_id.to_string()))
            }
        }
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, channel_name: &str) -> Result<(), RouterError> {
        let removed = self
            .connections
            .get_mut(connection_id)
            .is_some_and(|mut conn| conn.channels.remove(channel_name));

        if !removed {
            return Err(RouterError::NotSubscribed(channel_name.to_string()));
        }

        self.leave_room(connection_id, channel_name);
        Ok(())
    }

    fn leave_room(&self, connection_id: &str, channel_name: &str) {
        let now_empty = self
            .channels
            .get_mut(channel_name)
            .map(|mut channel| {
                channel.unsubscribe(connection_id);
                channel.is_empty()
            })
            .unwrap_or(false);

        if now_empty
            && self
                .channels
                .remove_if(channel_name, |_, channel| channel.is_empty())
                .is_some()
        {
            debug!(channel = %channel_name, "Deleted empty channel");
        }
    }

    /// Emit an event to every subscriber of a channel.
    ///
    /// Returns the number of connections it was handed to.
    pub fn emit(&self, channel_name: &str, event: &str, data: Value) -> usize {
        self.emit_except(channel_name, None, event, data)
    }

    /// Emit an event to every subscriber of a channel except one.
    ///
    /// Subscribers whose outbox is full miss the event.
    pub fn emit_except(
        &self,
        channel_name: &str,
        except: Option<&str>,
        event: &str,
        data: Value,
    ) -> usize {
        let Some(channel) = self.channels.get(channel_name) else {
            trace!(channel = %channel_name, event = %event, "Emit to channel without subscribers");
            return 0;
        };

        let delivery = Arc::new(Delivery::new(channel_name, event, data));
        let published = channel.publish(&delivery, except);
        if published.dropped > 0 {
            self.dropped.fetch_add(published.dropped as u64, Ordering::Relaxed);
        }
        trace!(
            channel = %channel_name,
            event = %event,
            recipients = published.delivered,
            dropped = published.dropped,
            "Emitted event"
        );
        published.delivered
    }

    /// Emit an event to a single connection.
    ///
    /// Returns `false` if the connection is gone or its outbox is full.
    pub fn emit_to(&self, connection_id: &str, channel_name: &str, event: &str, data: Value) -> bool {
        let Some(conn) = self.connections.get(connection_id) else {
            return false;
        };
        let delivery = Arc::new(Delivery::new(channel_name, event, data));
        match hand_off(connection_id, &conn.outbox, delivery) {
            Handoff::Queued => true,
            Handoff::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Handoff::Closed => false,
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str, channel_name: &str) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|conn| conn.channels.contains(channel_name))
    }

    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Get the channels a connection is subscribed to.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .get(connection_id)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionOracle for Router {
    async fn connected_ids(&self, channel: &str) -> Result<HashSet<String>, OracleError> {
        Ok(self
            .channels
            .get(channel)
            .map(|c| c.subscribers().into_iter().collect())
            .unwrap_or_default())
    }
}

impl PresenceNotifier for Router {
    fn emit_to_connection(&self, connection_id: &str, channel: &str, event: &str, data: Value) {
        self.emit_to(connection_id, channel, event, data);
    }

    fn emit_to_channel_except(&self, channel: &str, except: &str, event: &str, data: Value) {
        self.emit_except(channel, Some(except), event, data);
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of connected clients.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Deliveries dropped on full outboxes since startup.
    pub dropped_deliveries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_router_subscribe_unsubscribe() {
        let router = Router::new();
        let _rx = router.register("conn-1");

        router.subscribe("conn-1", "test:channel").unwrap();
        assert!(router.channel_exists("test:channel"));
        assert_eq!(router.subscriber_count("test:channel"), 1);
        assert!(router.is_subscribed("conn-1", "test:channel"));

        router.unsubscribe("conn-1", "test:channel").unwrap();
        assert!(!router.channel_exists("test:channel"));
        assert!(matches!(
            router.unsubscribe("conn-1", "test:channel"),
            Err(RouterError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let router = Router::new();
        assert!(matches!(
            router.subscribe("ghost", "news"),
            Err(RouterError::UnknownConnection(_))
        ));
        assert!(!router.channel_exists("news"));
    }

    #[test]
    fn test_router_emit() {
        let router = Router::new();
        let mut rx1 = router.register("conn-1");
        let mut rx2 = router.register("conn-2");
        router.subscribe("conn-1", "test").unwrap();
        router.subscribe("conn-2", "test").unwrap();

        assert_eq!(router.emit("test", "Created", json!({ "id": 1 })), 2);
        assert_eq!(rx1.try_recv().unwrap().event, "Created");
        assert_eq!(rx2.try_recv().unwrap().data, json!({ "id": 1 }));

        assert_eq!(router.emit_except("test", Some("conn-1"), "Updated", json!(null)), 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().event, "Updated");

        assert_eq!(router.emit("nobody", "Created", json!(null)), 0);
    }

    #[test]
    fn test_emit_to_single_connection() {
        let router = Router::new();
        let mut rx = router.register("conn-1");

        assert!(router.emit_to("conn-1", "presence-a", "presence:subscribed", json!([])));
        assert!(!router.emit_to("conn-2", "presence-a", "presence:subscribed", json!([])));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.channel, "presence-a");
    }

    #[test]
    fn test_router_invalid_channel() {
        let router = Router::new();
        let _rx = router.register("conn-1");
        assert!(router.subscribe("conn-1", "").is_err());
    }

    #[test]
    fn test_router_already_subscribed() {
        let router = Router::new();
        let _rx = router.register("conn-1");
        router.subscribe("conn-1", "test").unwrap();
        assert!(matches!(
            router.subscribe("conn-1", "test"),
            Err(RouterError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn test_subscription_limits() {
        let router = Router::with_config(RouterConfig {
            max_channels: 2,
            max_subscriptions_per_connection: 1,
            ..RouterConfig::default()
        });
        let _rx1 = router.register("conn-1");
        let _rx2 = router.register("conn-2");
        let _rx3 = router.register("conn-3");

        router.subscribe("conn-1", "a").unwrap();
        assert!(matches!(
            router.subscribe("conn-1", "b"),
            Err(RouterError::MaxSubscriptionsReached)
        ));

        router.subscribe("conn-2", "b").unwrap();
        assert!(matches!(
            router.subscribe("conn-3", "c"),
            Err(RouterError::MaxChannelsReached)
        ));
        router.subscribe("conn-3", "a").unwrap();
    }

    #[test]
    fn test_unregister_leaves_all_rooms() {
        let router = Router::new();
        let _rx = router.register("conn-1");
        router.subscribe("conn-1", "channel-1").unwrap();
        router.subscribe("conn-1", "channel-2").unwrap();

        let mut left = router.unregister("conn-1");
        left.sort();

        assert_eq!(left, vec!["channel-1".to_string(), "channel-2".to_string()]);
        assert!(!router.channel_exists("channel-1"));
        assert!(router.unregister("conn-1").is_empty());
    }

    #[test]
    fn test_router_stats() {
        let router = Router::new();
        let _rx1 = router.register("conn-1");
        let _rx2 = router.register("conn-2");
        router.subscribe("conn-1", "channel-1").unwrap();
        router.subscribe("conn-1", "channel-2").unwrap();
        router.subscribe("conn-2", "channel-1").unwrap();

        let stats = router.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.dropped_deliveries, 0);
    }

    #[test]
    fn test_stalled_connection_outbox_stays_bounded() {
        let router = Router::new();
        let capacity = RouterConfig::default().outbox_capacity;
        let mut stalled = router.register("stalled");
        router.subscribe("stalled", "firehose").unwrap();

        for n in 0..200_000 {
            router.emit("firehose", "tick", json!(n));
        }

        let mut queued = 0;
        while stalled.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, capacity);
        assert_eq!(router.dropped_deliveries(), (200_000 - capacity) as u64);

        // Draining makes room again.
        assert_eq!(router.emit("firehose", "tick", json!("late")), 1);
        assert_eq!(stalled.try_recv().unwrap().data, json!("late"));
    }

    #[test]
    fn test_emit_to_full_outbox() {
        let router = Router::with_config(RouterConfig {
            outbox_capacity: 1,
            ..RouterConfig::default()
        });
        let mut rx = router.register("conn-1");

        assert!(router.emit_to("conn-1", "presence-a", "presence:subscribed", json!([])));
        assert!(!router.emit_to("conn-1", "presence-a", "presence:joining", json!({})));
        assert_eq!(router.stats().dropped_deliveries, 1);

        assert_eq!(rx.try_recv().unwrap().event, "presence:subscribed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oracle_reports_room_members() {
        let router = Router::new();
        let _rx1 = router.register("conn-1");
        let _rx2 = router.register("conn-2");
        router.subscribe("conn-1", "presence-a").unwrap();
        router.subscribe("conn-2", "presence-a").unwrap();
        router.unsubscribe("conn-2", "presence-a").unwrap();

        let ids = router.connected_ids("presence-a").await.unwrap();
        assert_eq!(ids, HashSet::from(["conn-1".to_string()]));
        assert!(router.connected_ids("presence-b").await.unwrap().is_empty());
    }
}
