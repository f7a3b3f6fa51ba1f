//! Codec for encoding and decoding Courier events.
//!
//! Binary frames use MessagePack with a 4-byte big-endian length prefix.
//! Text frames carry plain JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest payload accepted in either direction (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes in the big-endian `u32` that precedes each MessagePack payload.
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// The buffer ends before the frame does; holds the missing byte count.
    #[error("truncated frame, {0} bytes missing")]
    Incomplete(usize),

    #[error("messagepack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("messagepack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a connection's frames are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON in WebSocket text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack in WebSocket binary frames.
    MessagePack,
}

/// An encoded event, ready to become a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(s) => s.len(),
            WireFrame::Binary(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inspect the length prefix at the start of `data`.
///
/// Yields the full frame size (prefix included) once the prefix is readable,
/// `Ok(None)` while it is not, and an error for an oversized payload.
fn frame_size(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut prefix = prefix;
    let payload = prefix.get_u32() as usize;
    if payload > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload));
    }
    Ok(Some(LENGTH_PREFIX_SIZE + payload))
}

/// Serialize `value` as one length-prefixed MessagePack frame.
///
/// # Errors
///
/// Fails when serialization fails or the payload is over [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Append one frame for `value` to `buf`.
///
/// # Errors
///
/// Fails when serialization fails or the payload is over [`MAX_FRAME_SIZE`].
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(())
}

/// Deserialize the single frame at the start of `data`.
///
/// # Errors
///
/// Fails on a truncated or oversized frame, or an undecodable payload.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let size = frame_size(data)?.unwrap_or(LENGTH_PREFIX_SIZE);
    if data.len() < size {
        return Err(ProtocolError::Incomplete(size - data.len()));
    }
    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..size])?)
}

/// Take the next complete frame off the front of `buf`.
///
/// `Ok(None)` leaves `buf` untouched until more bytes arrive.
///
/// # Errors
///
/// Fails on an oversized frame or an undecodable payload.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    match frame_size(buf)? {
        Some(size) if buf.len() >= size => {
            let frame = buf.split_to(size);
            Ok(Some(rmp_serde::from_slice(&frame[LENGTH_PREFIX_SIZE..])?))
        }
        _ => Ok(None),
    }
}

/// Deserialize a JSON text frame.
///
/// # Errors
///
/// Fails when the text is over [`MAX_FRAME_SIZE`] or is not valid JSON for `T`.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode `value` the way a connection using `encoding` expects it.
///
/// # Errors
///
/// Fails when serialization fails.
pub fn encode_with<T: Serialize>(encoding: Encoding, value: &T) -> Result<WireFrame, ProtocolError> {
    Ok(match encoding {
        Encoding::Json => WireFrame::Text(serde_json::to_string(value)?),
        Encoding::MessagePack => WireFrame::Binary(encode(value)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, SendMessage, ServerEvent};

    #[test]
    fn test_client_events_survive_messagepack() {
        let events = vec![
            ClientEvent::connect("token123"),
            ClientEvent::join("conv-1"),
            ClientEvent::SendMessage(SendMessage::direct("alice", "hello")),
            ClientEvent::MarkMessagesRead {
                conversation_id: "conv-1".into(),
                message_ids: vec!["m1".into(), "m2".into()],
            },
            ClientEvent::Ping { timestamp: Some(7) },
        ];

        for event in events {
            let encoded = encode(&event).unwrap();
            let decoded: ClientEvent = decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ClientEvent::join("conv-1")).unwrap();

        let partial = &encoded[..5];
        match decode::<ClientEvent>(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let event = ClientEvent::SendMessage(SendMessage::direct("alice", "x".repeat(MAX_FRAME_SIZE + 1)));

        match encode(&event) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::typing_start("c1");
        let second = ClientEvent::typing_stop("c1");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        let decoded1: ClientEvent = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: ClientEvent = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(first, decoded1);
        assert_eq!(second, decoded2);
        assert!(buf.is_empty());
        assert!(decode_from::<ClientEvent>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_with_json() {
        let frame = encode_with(Encoding::Json, &ServerEvent::pong(Some(1))).unwrap();
        match frame {
            WireFrame::Text(text) => {
                assert_eq!(text, r#"{"event":"pong","data":{"timestamp":1}}"#);
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_text_rejects_garbage() {
        assert!(matches!(
            decode_text::<ClientEvent>("not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
