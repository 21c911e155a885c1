//! # herald-protocol
//!
//! Wire protocol spoken between Herald and its WebSocket clients.
//!
//! Frames travel either as JSON in text messages or as length-prefixed
//! MessagePack in binary messages. The server answers in whichever encoding
//! the client used last.
//!
//! ## Frame Types
//!
//! - `Subscribe` / `Unsubscribe` - Channel membership
//! - `ClientEvent` - Client-originated events ("whispers")
//! - `Event` - Server-to-client delivery, including presence notifications
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, Encoding, Frame};
//!
//! let frame = Frame::subscribe(1, "presence-lobby");
//!
//! let encoded = codec::encode(&frame, Encoding::Json).unwrap();
//! let decoded = codec::decode(&encoded, Encoding::Json).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, ChannelData, Frame, FrameType, PROTOCOL_VERSION};
