//! Protocol message model

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::codec::{DecodeError, EncodeError};

/// Message types exchanged over the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HandshakeRequest = 0,
    HandshakeResponse = 1,
    HandshakeComplete = 2,
    ChannelOpen = 3,
    Data = 4,
    Acknowledge = 5,
    ChannelClosed = 6,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HandshakeRequest => "handshake_request",
            MessageType::HandshakeResponse => "handshake_response",
            MessageType::HandshakeComplete => "handshake_complete",
            MessageType::ChannelOpen => "channel_open",
            MessageType::Data => "data",
            MessageType::Acknowledge => "acknowledge",
            MessageType::ChannelClosed => "channel_closed",
        }
    }

    /// Handshake-phase messages live outside the sequenced byte stream
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::HandshakeRequest
                | MessageType::HandshakeResponse
                | MessageType::HandshakeComplete
                | MessageType::ChannelOpen
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::HandshakeRequest),
            1 => Ok(MessageType::HandshakeResponse),
            2 => Ok(MessageType::HandshakeComplete),
            3 => Ok(MessageType::ChannelOpen),
            4 => Ok(MessageType::Data),
            5 => Ok(MessageType::Acknowledge),
            6 => Ok(MessageType::ChannelClosed),
            _ => Err(DecodeError::UnknownMessageType(value)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u16);

impl MessageFlags {
    pub const FINAL_FRAGMENT: u16 = 0b0000_0001;
    pub const ACK_REQUEST: u16 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_final(mut self) -> Self {
        self.0 |= Self::FINAL_FRAGMENT;
        self
    }

    pub fn with_ack_request(mut self) -> Self {
        self.0 |= Self::ACK_REQUEST;
        self
    }

    pub fn is_final(&self) -> bool {
        self.0 & Self::FINAL_FRAGMENT != 0
    }

    pub fn requests_ack(&self) -> bool {
        self.0 & Self::ACK_REQUEST != 0
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub schema_version: u32,
    /// Milliseconds since the Unix epoch, informational only
    pub created_at: u64,
    pub sequence_number: u32,
    pub flags: MessageFlags,
    pub message_id: Uuid,
    pub payload: Bytes,
}

impl Message {
    /// Header size: type (1) + schema (4) + created_at (8) + seq (4) + flags (2)
    /// + message_id (16) + payload length (4) + digest (32) = 71 bytes
    pub const HEADER_SIZE: usize = 71;

    pub fn new(message_type: MessageType, sequence_number: u32, payload: Bytes) -> Self {
        Self {
            message_type,
            schema_version: crate::SCHEMA_VERSION,
            created_at: now_millis(),
            sequence_number,
            flags: MessageFlags::new(),
            message_id: Uuid::new_v4(),
            payload,
        }
    }

    /// Sequenced data message starting at byte offset `sequence_number`
    pub fn data(sequence_number: u32, payload: Bytes) -> Self {
        Self::new(MessageType::Data, sequence_number, payload)
    }

    /// Cumulative acknowledgment of every inbound byte below `offset`
    pub fn acknowledge(offset: u32) -> Self {
        Self::new(MessageType::Acknowledge, offset, Bytes::new())
    }

    pub fn channel_closed() -> Self {
        Self::new(
            MessageType::ChannelClosed,
            crate::CONTROL_SEQUENCE,
            Bytes::new(),
        )
    }

    /// Control message carrying a JSON document (handshake and channel_open)
    pub fn control_json<T: Serialize>(
        message_type: MessageType,
        document: &T,
    ) -> Result<Self, EncodeError> {
        let payload = serde_json::to_vec(document)?;
        Ok(Self::new(
            message_type,
            crate::CONTROL_SEQUENCE,
            Bytes::from(payload),
        ))
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// SHA-256 digest of the payload
    pub fn payload_digest(&self) -> [u8; 32] {
        Sha256::digest(&self.payload).into()
    }

    /// Encode the message body (everything after the frame length prefix)
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(EncodeError::PayloadTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u8(self.message_type as u8);
        buf.put_u32(self.schema_version);
        buf.put_u64(self.created_at);
        buf.put_u32(self.sequence_number);
        buf.put_u16(self.flags.as_u16());
        buf.put_slice(self.message_id.as_bytes());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload_digest());
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode exactly one message body
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: Self::HEADER_SIZE,
                available: buf.len(),
            });
        }

        let message_type = MessageType::try_from(buf.get_u8())?;
        let schema_version = buf.get_u32();
        if !crate::is_supported_schema(schema_version) {
            return Err(DecodeError::UnsupportedSchemaVersion(schema_version));
        }
        let created_at = buf.get_u64();
        let sequence_number = buf.get_u32();
        let flags = MessageFlags::from_u16(buf.get_u16());

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let message_id = Uuid::from_bytes(id);

        let length = buf.get_u32() as usize;
        if length > crate::MAX_FRAME_SIZE as usize {
            return Err(DecodeError::FrameTooLarge(length));
        }

        let mut digest = [0u8; 32];
        buf.copy_to_slice(&mut digest);

        if buf.remaining() < length {
            return Err(DecodeError::Truncated {
                needed: length,
                available: buf.remaining(),
            });
        }
        if buf.remaining() > length {
            return Err(DecodeError::LengthMismatch {
                declared: length,
                actual: buf.remaining(),
            });
        }

        let message = Self {
            message_type,
            schema_version,
            created_at,
            sequence_number,
            flags,
            message_id,
            payload: buf.split_to(length),
        };

        if message.payload_digest() != digest {
            return Err(DecodeError::DigestMismatch {
                message_id: message.message_id,
            });
        }

        Ok(message)
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
