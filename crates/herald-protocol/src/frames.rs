//! Frame types for the Herald protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version announced in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 4000;
    /// The channel name is invalid or a limit was hit.
    pub const SUBSCRIBE_REJECTED: u16 = 4001;
    /// Presence channel subscription without member data.
    pub const MISSING_CHANNEL_DATA: u16 = 4002;
    /// The connection is not subscribed to the channel.
    pub const NOT_SUBSCRIBED: u16 = 4003;
    /// Client events are only allowed on private and presence channels.
    pub const CLIENT_EVENT_REJECTED: u16 = 4004;
    /// Presence state could not be stored.
    pub const PRESENCE_UNAVAILABLE: u16 = 4500;
}

/// Frame type identifiers, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    ClientEvent,
    Ping,
    Connected,
    Event,
    Ack,
    Error,
    Pong,
}

/// Member data sent along with a presence channel subscription.
///
/// Both fields are optional on the wire so that a missing field can be
/// reported back to the client instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

impl ChannelData {
    /// Create channel data for a user.
    #[must_use]
    pub fn new(user_id: impl Into<Value>, user_info: Value) -> Self {
        Self {
            user_id: Some(user_id.into()),
            user_info: Some(user_info),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Subscribe to a channel (client → server).
    Subscribe {
        /// Request ID echoed in the ack or error.
        id: u64,
        /// Channel name.
        channel: String,
        /// Member data, required for presence channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_data: Option<ChannelData>,
    },

    /// Unsubscribe from a channel (client → server).
    Unsubscribe { id: u64, channel: String },

    /// Event published by a client to the other members of a channel.
    ClientEvent {
        channel: String,
        event: String,
        #[serde(default)]
        data: Value,
    },

    /// Keepalive ping (client → server).
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent once after the socket is accepted (server → client).
    Connected {
        /// Identifier of this connection, used as `socket_id` when publishing.
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Event delivered on a channel (server → client).
    Event {
        channel: String,
        event: String,
        data: Value,
    },

    /// Acknowledgment of a request.
    Ack { id: u64 },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive pong, echoing the ping timestamp.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::ClientEvent { .. } => FrameType::ClientEvent,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Subscribe frame without member data.
    #[must_use]
    pub fn subscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            channel_data: None,
        }
    }

    /// Create a Subscribe frame for a presence channel.
    #[must_use]
    pub fn subscribe_presence(id: u64, channel: impl Into<String>, data: ChannelData) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            channel_data: Some(data),
        }
    }

    /// Create an Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            channel: channel.into(),
        }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}
