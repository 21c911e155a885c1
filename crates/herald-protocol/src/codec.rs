//! Codec for encoding and decoding Herald frames.
//!
//! Text WebSocket messages carry one JSON frame each. Binary messages carry
//! MessagePack frames behind a 4-byte big-endian length prefix, so several
//! frames can share one message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame encodings understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON text, one frame per message.
    #[default]
    Json,
    /// Length-prefixed MessagePack.
    MessagePack,
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &Frame, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let payload = serde_json::to_vec(frame)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            Ok(Bytes::from(payload))
        }
        Encoding::MessagePack => {
            let mut buf = BytesMut::new();
            encode_into(frame, &mut buf)?;
            Ok(buf.freeze())
        }
    }
}

/// Append a length-prefixed MessagePack frame to a buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8], encoding: Encoding) -> Result<Frame, ProtocolError> {
    match encoding {
        Encoding::Json => {
            if data.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(data.len()));
            }
            Ok(serde_json::from_slice(data)?)
        }
        Encoding::MessagePack => {
            if data.len() < LENGTH_PREFIX_SIZE {
                return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
            }
            let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if length > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(length));
            }
            let total_size = LENGTH_PREFIX_SIZE + length;
            if data.len() < total_size {
                return Err(ProtocolError::Incomplete(total_size - data.len()));
            }
            Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
        }
    }
}

/// Try to decode a MessagePack frame from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` when more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}
