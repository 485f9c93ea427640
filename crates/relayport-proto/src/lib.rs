//! Relay Session Protocol Definitions
//!
//! This crate defines the wire-level message model, the framing codec, the
//! handshake documents and the per-connection segment sub-header used by the
//! port-forwarding channel.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod segment;

pub use codec::{DecodeError, EncodeError, FrameCodec};
pub use handshake::{
    parse_document, Capabilities, ChannelOpen, HandshakeComplete, HandshakeRequest,
    HandshakeResponse,
};
pub use message::{Message, MessageFlags, MessageType};
pub use segment::{
    ConnId, Segment, SegmentError, SegmentKind, CONNECTION_WINDOW, SINGLE_CONN_ID,
};

/// Schema version spoken by this implementation
pub const SCHEMA_VERSION: u32 = 1;

/// Every schema version this implementation can decode
pub const SUPPORTED_SCHEMA_VERSIONS: &[u32] = &[1];

/// Protocol ceiling for a single frame payload (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved sequence number carried by messages outside the byte stream
pub const CONTROL_SEQUENCE: u32 = u32::MAX;

/// Returns true when `version` can be decoded by this implementation
pub fn is_supported_schema(version: u32) -> bool {
    SUPPORTED_SCHEMA_VERSIONS.contains(&version)
}
