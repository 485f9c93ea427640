//! Handshake documents carried as JSON payloads of control messages

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::DecodeError;
use crate::message::Message;

/// Capabilities negotiated during the handshake
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// Largest data payload either side will put in one frame
    pub max_frame_size: u32,
    /// Whether several local connections may share the channel at once
    #[serde(default)]
    pub multiplexing: bool,
}

/// First message on a usable transport, binds it to a broker session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelOpen {
    pub session_id: String,
    pub token: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub schema_versions: Vec<u32>,
    pub capabilities: Capabilities,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub schema_version: u32,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub handshake_time_ms: u64,
    pub client_version: String,
}

/// Parse the JSON document carried by a control message
pub fn parse_document<T: DeserializeOwned>(msg: &Message) -> Result<T, DecodeError> {
    Ok(serde_json::from_slice(&msg.payload)?)
}
