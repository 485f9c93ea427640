//! Length-prefixed framing for protocol messages

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::message::Message;

/// Errors raised while turning a message into bytes
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Payload too large: {0} bytes (chunk before encoding)")]
    PayloadTooLarge(usize),

    #[error("Failed to serialize control document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Errors raised while parsing bytes into a message
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unsupported schema version: {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("Payload digest mismatch for message {message_id}")]
    DigestMismatch { message_id: Uuid },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Frame length mismatch: declared {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Malformed control document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Frame codec for the transport boundary
pub struct FrameCodec;

impl FrameCodec {
    /// Size of the big-endian length prefix
    pub const LENGTH_PREFIX: usize = 4;

    /// Largest frame body accepted off the wire
    pub const MAX_BODY_SIZE: usize = Message::HEADER_SIZE + crate::MAX_FRAME_SIZE as usize;

    /// Encode a message to a transport frame
    ///
    /// Format: [length: u32][message body]
    pub fn encode(msg: &Message) -> Result<Bytes, EncodeError> {
        let body = msg.encode()?;

        let mut buf = BytesMut::with_capacity(Self::LENGTH_PREFIX + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        Ok(buf.freeze())
    }

    /// Decode a message from an accumulating buffer
    ///
    /// Returns Ok(Some(message)) once a complete frame was consumed,
    /// Ok(None) if more bytes are needed (the buffer is left untouched),
    /// Err if the frame is invalid (the offending frame is consumed).
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        if buf.len() < Self::LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_BODY_SIZE {
            return Err(DecodeError::FrameTooLarge(length));
        }

        if buf.len() < Self::LENGTH_PREFIX + length {
            return Ok(None);
        }

        buf.advance(Self::LENGTH_PREFIX);
        let body = buf.split_to(length).freeze();

        Message::decode(body).map(Some)
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Message>, DecodeError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}
