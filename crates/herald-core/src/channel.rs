//! Channel abstraction for Herald.
//!
//! A channel is a named room. It holds the outbox of every subscribed
//! connection so that publishing never has to consult the connection registry.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Prefix marking a presence channel.
pub const PRESENCE_PREFIX: &str = "presence-";

/// Prefix marking a private channel.
pub const PRIVATE_PREFIX: &str = "private-";

/// Prefix of events clients may send to each other.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// A channel identifier.
pub type ChannelId = String;

/// An event on its way to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: ChannelId,
    pub event: String,
    pub data: Value,
}

impl Delivery {
    #[must_use]
    pub fn new(channel: impl Into<ChannelId>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// Sending half of a connection's outbox.
///
/// Outboxes are bounded. A delivery to a full outbox is dropped rather than
/// queued, so one stalled socket cannot grow the server without limit.
pub type Outbox = mpsc::Sender<Arc<Delivery>>;

/// Receiving half of a connection's outbox.
pub type Inbox = mpsc::Receiver<Arc<Delivery>>;

/// What happened to one delivery handed to an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Queued,
    /// The outbox was full.
    Dropped,
    /// The receiving connection is gone.
    Closed,
}

/// Hand a delivery to an outbox without waiting.
pub fn hand_off(connection_id: &str, outbox: &Outbox, delivery: Arc<Delivery>) -> Handoff {
    match outbox.try_send(delivery) {
        Ok(()) => Handoff::Queued,
        Err(TrySendError::Full(delivery)) => {
            warn!(
                connection = %connection_id,
                channel = %delivery.channel,
                event = %delivery.event,
                "Outbox full, dropping delivery"
            );
            Handoff::Dropped
        }
        Err(TrySendError::Closed(_)) => Handoff::Closed,
    }
}

/// Outcome of publishing one event to a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Published {
    /// Outboxes that queued the delivery.
    pub delivered: usize,
    /// Outboxes that were full.
    pub dropped: usize,
}

/// Channel kinds, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Classify a channel name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelKind::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    #[must_use]
    pub fn is_presence(self) -> bool {
        self == ChannelKind::Presence
    }

    /// Whether clients may publish `client-` events on this kind of channel.
    #[must_use]
    pub fn allows_client_events(self) -> bool {
        self != ChannelKind::Public
    }
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A room of subscribed connections.
#[derive(Debug)]
pub struct Channel {
    name: ChannelId,
    kind: ChannelKind,
    /// Subscribed connection IDs and their outboxes.
    subscribers: HashMap<String, Outbox>,
}

impl Channel {
    /// Create a new, empty channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        let name = name.into();
        Self {
            kind: ChannelKind::of(&name),
            name,
            subscribers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    /// Add a connection to the room.
    ///
    /// Returns `false` if it was already there.
    pub fn subscribe(&mut self, connection_id: impl Into<String>, outbox: Outbox) -> bool {
        let conn_id = connection_id.into();
        if self.subscribers.contains_key(&conn_id) {
            return false;
        }
        debug!(channel = %self.name, connection = %conn_id, "Connection subscribed");
        self.subscribers.insert(conn_id, outbox);
        true
    }

    /// Remove a connection from the room.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &str) -> bool {
        let removed = self.subscribers.remove(connection_id).is_some();
        if removed {
            debug!(channel = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Deliver to every subscriber except `except`.
    ///
    /// Never waits on a slow subscriber; full outboxes are counted as dropped.
    pub fn publish(&self, delivery: &Arc<Delivery>, except: Option<&str>) -> Published {
        trace!(channel = %self.name, event = %delivery.event, "Publishing event");
        let mut published = Published::default();
        for (id, outbox) in &self.subscribers {
            if Some(id.as_str()) == except {
                continue;
            }
            match hand_off(id, outbox, Arc::clone(delivery)) {
                Handoff::Queued => published.delivered += 1,
                Handoff::Dropped => published.dropped += 1,
                Handoff::Closed => {}
            }
        }
        published
    }

    /// IDs of all subscribed connections.
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        self.subscribers.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
