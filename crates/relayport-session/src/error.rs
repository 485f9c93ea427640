//! Error taxonomy for forwarding sessions

use relayport_proto::{DecodeError, EncodeError, MessageType, SegmentError};
use relayport_transport::TransportError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::external::{BrokerError, ResolveError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid channel configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Peer selected schema version {selected}, offered {offered:?}")]
    UnsupportedVersion { selected: u32, offered: Vec<u32> },

    #[error("No common schema version (peer offered {0:?})")]
    NoCommonVersion(Vec<u32>),

    #[error("Capabilities rejected: {0}")]
    CapabilitiesRejected(String),

    #[error("Peer reported handshake errors: {}", .0.join("; "))]
    PeerErrors(Vec<String>),

    #[error("Channel open rejected: {0}")]
    Rejected(String),

    #[error("Malformed handshake message: {0}")]
    Malformed(#[from] DecodeError),

    #[error("Unexpected {0} message during handshake")]
    UnexpectedMessage(MessageType),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport closed during handshake")]
    TransportClosed,

    #[error("Failed to encode handshake message: {0}")]
    Encode(#[from] EncodeError),
}

/// Unrecoverable conditions of an open channel
#[derive(Debug, Error)]
pub enum ChannelFailure {
    #[error("Retransmission limit reached for offset {offset} after {attempts} attempts")]
    RetriesExhausted { offset: u64, attempts: u32 },

    #[error("No acknowledgment progress for {0:?}")]
    Stalled(Duration),

    #[error("Inbound reorder buffer exceeded {limit} bytes")]
    InboundOverflow { limit: usize },

    #[error("Fragment at offset {offset} partially overlaps data already received")]
    PartialOverlap { offset: u64 },

    #[error("Window overflow: {in_flight} bytes in flight, window is {max_window}")]
    WindowOverflow { in_flight: usize, max_window: usize },

    #[error("Corrupt frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] EncodeError),

    #[error("Malformed segment: {0}")]
    Segment(#[from] SegmentError),

    #[error("Channel task ended unexpectedly: {0}")]
    TaskAborted(String),
}

/// Stage of a forwarding session, used when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Configure,
    Resolve,
    CreateSession,
    Bind,
    Connect,
    Handshake,
    Streaming,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Configure => "configure",
            SessionPhase::Resolve => "resolve",
            SessionPhase::CreateSession => "create-session",
            SessionPhase::Bind => "bind",
            SessionPhase::Connect => "connect",
            SessionPhase::Handshake => "handshake",
            SessionPhase::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Target resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Session creation failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to bind local listener on {addr}: {source}")]
    LocalBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect session stream: {0}")]
    Connect(#[source] TransportError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Channel failed: {0}")]
    Channel(#[from] ChannelFailure),

    /// Shutdown was requested before the channel opened
    #[error("Cancelled before the channel opened")]
    Cancelled,
}

impl SessionError {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionError::Config(_) => SessionPhase::Configure,
            SessionError::Resolve(_) => SessionPhase::Resolve,
            SessionError::Broker(_) => SessionPhase::CreateSession,
            SessionError::LocalBind { .. } => SessionPhase::Bind,
            SessionError::Connect(_) => SessionPhase::Connect,
            SessionError::Handshake(_) | SessionError::Cancelled => SessionPhase::Handshake,
            SessionError::Transport(_) | SessionError::Channel(_) => SessionPhase::Streaming,
        }
    }
}
