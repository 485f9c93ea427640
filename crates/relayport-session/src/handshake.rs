//! Handshake state machines for both ends of the channel
//!
//! The initiating side sends `channel_open` followed by `handshake_request`,
//! validates the `handshake_response` and answers with `handshake_complete`.
//! The responding side validates the session token, picks the highest common
//! schema version and clamps the frame size to what both ends accept.

use relayport_proto::{
    parse_document, Capabilities, ChannelOpen, HandshakeComplete, HandshakeRequest,
    HandshakeResponse, Message, MessageType, Segment,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ForwardingMode};
use crate::error::HandshakeError;

/// Version string announced in handshake documents
pub const CLIENT_VERSION: &str = concat!("relayport/", env!("CARGO_PKG_VERSION"));

/// Parameters both ends agreed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub schema_version: u32,
    /// Largest data payload, sub-header included
    pub max_frame_size: usize,
    pub mode: ForwardingMode,
}

impl Negotiated {
    /// Largest chunk of connection bytes that fits in one data payload
    pub fn max_chunk(&self) -> usize {
        self.max_frame_size - Segment::HEADER_SIZE
    }
}

fn capabilities_for(config: &ChannelConfig) -> Capabilities {
    Capabilities {
        max_frame_size: config.max_frame_size as u32,
        multiplexing: config.mode == ForwardingMode::Multiplexed,
    }
}

/// Initiating side of the handshake
#[derive(Debug)]
pub struct ClientHandshake {
    open: ChannelOpen,
    offered: Vec<u32>,
    requested: Capabilities,
    started: Option<Instant>,
}

impl ClientHandshake {
    pub fn new(config: &ChannelConfig, session_id: &str, token: &str) -> Self {
        Self {
            open: ChannelOpen {
                session_id: session_id.to_string(),
                token: token.to_string(),
                client_version: CLIENT_VERSION.to_string(),
            },
            offered: config.schema_versions.clone(),
            requested: capabilities_for(config),
            started: None,
        }
    }

    /// Messages that open the handshake, in sending order
    pub fn start(&mut self, now: Instant) -> Result<Vec<Message>, HandshakeError> {
        self.started = Some(now);
        let request = HandshakeRequest {
            schema_versions: self.offered.clone(),
            capabilities: self.requested,
            client_version: CLIENT_VERSION.to_string(),
        };

        debug!(
            "Starting handshake for session {} (offering versions {:?})",
            self.open.session_id, self.offered
        );

        Ok(vec![
            Message::control_json(MessageType::ChannelOpen, &self.open)?,
            Message::control_json(MessageType::HandshakeRequest, &request)?,
        ])
    }

    /// Handle a message received while handshaking
    ///
    /// Returns the negotiated parameters and the `handshake_complete` message
    /// to send once the peer's response has been accepted.
    pub fn on_message(
        &mut self,
        msg: &Message,
        now: Instant,
    ) -> Result<Option<(Negotiated, Message)>, HandshakeError> {
        match msg.message_type {
            MessageType::HandshakeResponse => {
                let response: HandshakeResponse = parse_document(msg)?;
                let negotiated = self.validate(&response)?;

                let elapsed = self
                    .started
                    .map(|started| now.saturating_duration_since(started))
                    .unwrap_or_default();
                let complete = HandshakeComplete {
                    handshake_time_ms: elapsed.as_millis() as u64,
                    client_version: CLIENT_VERSION.to_string(),
                };
                let reply = Message::control_json(MessageType::HandshakeComplete, &complete)?
                    .with_schema_version(negotiated.schema_version);

                info!(
                    "Handshake complete in {}ms (schema v{}, max frame {} bytes, {:?})",
                    complete.handshake_time_ms,
                    negotiated.schema_version,
                    negotiated.max_frame_size,
                    negotiated.mode
                );
                Ok(Some((negotiated, reply)))
            }
            MessageType::ChannelClosed => Err(HandshakeError::Rejected(
                "peer closed the channel during the handshake".to_string(),
            )),
            other => Err(HandshakeError::UnexpectedMessage(other)),
        }
    }

    fn validate(&self, response: &HandshakeResponse) -> Result<Negotiated, HandshakeError> {
        if !response.errors.is_empty() {
            return Err(HandshakeError::PeerErrors(response.errors.clone()));
        }

        if !self.offered.contains(&response.schema_version) {
            return Err(HandshakeError::UnsupportedVersion {
                selected: response.schema_version,
                offered: self.offered.clone(),
            });
        }

        let frame = response.capabilities.max_frame_size;
        if frame as usize <= Segment::HEADER_SIZE || frame > self.requested.max_frame_size {
            return Err(HandshakeError::CapabilitiesRejected(format!(
                "max_frame_size {} outside (0, {}]",
                frame, self.requested.max_frame_size
            )));
        }

        let mode = if self.requested.multiplexing && response.capabilities.multiplexing {
            ForwardingMode::Multiplexed
        } else {
            if self.requested.multiplexing {
                warn!("Peer declined multiplexing, forwarding one connection at a time");
            }
            ForwardingMode::Single
        };

        Ok(Negotiated {
            schema_version: response.schema_version,
            max_frame_size: frame as usize,
            mode,
        })
    }
}

#[derive(Debug)]
enum AgentStage {
    AwaitOpen,
    AwaitRequest,
    AwaitComplete(Negotiated),
}

/// What the responding side does after a handshake message
#[derive(Debug)]
pub enum AgentStep {
    /// Nothing to send yet
    Continue,
    /// Send this reply and keep handshaking
    Reply(Message),
    /// Send this reply, then fail with `error`
    Refuse {
        reply: Message,
        error: HandshakeError,
    },
    /// The channel is open; `pending` is a data message that opened it implicitly
    Open {
        negotiated: Negotiated,
        pending: Option<Message>,
    },
}

/// Responding side of the handshake
#[derive(Debug)]
pub struct AgentHandshake {
    supported: Vec<u32>,
    max_frame_size: u32,
    allow_multiplexing: bool,
    expected_token: Option<String>,
    stage: AgentStage,
}

impl AgentHandshake {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            supported: config.schema_versions.clone(),
            max_frame_size: config.max_frame_size as u32,
            allow_multiplexing: config.mode == ForwardingMode::Multiplexed,
            expected_token: None,
            stage: AgentStage::AwaitOpen,
        }
    }

    /// Require `channel_open` to carry this token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.expected_token = Some(token.into());
        self
    }

    pub fn on_message(&mut self, msg: Message) -> Result<AgentStep, HandshakeError> {
        match (&self.stage, msg.message_type) {
            (AgentStage::AwaitOpen, MessageType::ChannelOpen) => {
                let open: ChannelOpen = parse_document(&msg)?;
                if let Some(expected) = &self.expected_token {
                    if &open.token != expected {
                        warn!("Rejecting session {}: invalid token", open.session_id);
                        return self.refuse(
                            "invalid session token",
                            HandshakeError::Rejected("invalid session token".to_string()),
                        );
                    }
                }
                info!(
                    "Channel open for session {} from {}",
                    open.session_id, open.client_version
                );
                self.stage = AgentStage::AwaitRequest;
                Ok(AgentStep::Continue)
            }
            (AgentStage::AwaitRequest, MessageType::HandshakeRequest) => {
                let request: HandshakeRequest = parse_document(&msg)?;
                self.negotiate(request)
            }
            (AgentStage::AwaitComplete(negotiated), MessageType::HandshakeComplete) => {
                let negotiated = *negotiated;
                let complete: HandshakeComplete = parse_document(&msg)?;
                debug!(
                    "Peer {} completed handshake in {}ms",
                    complete.client_version, complete.handshake_time_ms
                );
                Ok(AgentStep::Open {
                    negotiated,
                    pending: None,
                })
            }
            (AgentStage::AwaitComplete(negotiated), MessageType::Data) => {
                debug!("Data before handshake_complete, treating the channel as open");
                Ok(AgentStep::Open {
                    negotiated: *negotiated,
                    pending: Some(msg),
                })
            }
            (_, MessageType::ChannelClosed) => Err(HandshakeError::Rejected(
                "peer closed the channel during the handshake".to_string(),
            )),
            (_, other) => Err(HandshakeError::UnexpectedMessage(other)),
        }
    }

    fn negotiate(&mut self, request: HandshakeRequest) -> Result<AgentStep, HandshakeError> {
        let selected = request
            .schema_versions
            .iter()
            .copied()
            .filter(|v| self.supported.contains(v))
            .max();

        let Some(schema_version) = selected else {
            return self.refuse(
                "no common schema version",
                HandshakeError::NoCommonVersion(request.schema_versions),
            );
        };

        if request.capabilities.max_frame_size as usize <= Segment::HEADER_SIZE {
            return self.refuse(
                "max_frame_size too small",
                HandshakeError::CapabilitiesRejected(format!(
                    "requested max_frame_size {}",
                    request.capabilities.max_frame_size
                )),
            );
        }

        let capabilities = Capabilities {
            max_frame_size: request.capabilities.max_frame_size.min(self.max_frame_size),
            multiplexing: request.capabilities.multiplexing && self.allow_multiplexing,
        };
        let negotiated = Negotiated {
            schema_version,
            max_frame_size: capabilities.max_frame_size as usize,
            mode: if capabilities.multiplexing {
                ForwardingMode::Multiplexed
            } else {
                ForwardingMode::Single
            },
        };

        let response = HandshakeResponse {
            schema_version,
            capabilities,
            errors: Vec::new(),
        };
        let reply = Message::control_json(MessageType::HandshakeResponse, &response)?
            .with_schema_version(schema_version);

        self.stage = AgentStage::AwaitComplete(negotiated);
        Ok(AgentStep::Reply(reply))
    }

    fn refuse(&self, reason: &str, error: HandshakeError) -> Result<AgentStep, HandshakeError> {
        let response = HandshakeResponse {
            schema_version: self.supported.iter().copied().max().unwrap_or(1),
            capabilities: Capabilities {
                max_frame_size: 0,
                multiplexing: false,
            },
            errors: vec![reason.to_string()],
        };
        let reply = Message::control_json(MessageType::HandshakeResponse, &response)?;
        Ok(AgentStep::Refuse { reply, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn response(schema_version: u32, max_frame_size: u32, errors: Vec<String>) -> Message {
        Message::control_json(
            MessageType::HandshakeResponse,
            &HandshakeResponse {
                schema_version,
                capabilities: Capabilities {
                    max_frame_size,
                    multiplexing: true,
                },
                errors,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_client_start_sends_open_then_request() {
        let mut client = ClientHandshake::new(&ChannelConfig::default(), "s-1", "secret");
        let messages = client.start(Instant::now()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::ChannelOpen);
        assert_eq!(messages[1].message_type, MessageType::HandshakeRequest);

        let open: ChannelOpen = parse_document(&messages[0]).unwrap();
        assert_eq!(open.session_id, "s-1");
        assert_eq!(open.token, "secret");
        let request: HandshakeRequest = parse_document(&messages[1]).unwrap();
        assert_eq!(request.schema_versions, vec![1]);
        assert_eq!(request.capabilities.max_frame_size, 16 * 1024);
        assert!(request.capabilities.multiplexing);
    }

    #[test]
    fn test_client_accepts_valid_response() {
        let mut client = ClientHandshake::new(&ChannelConfig::default(), "s-1", "");
        let now = Instant::now();
        client.start(now).unwrap();

        let (negotiated, reply) = client
            .on_message(&response(1, 8192, vec![]), now)
            .unwrap()
            .unwrap();
        assert_eq!(negotiated.schema_version, 1);
        assert_eq!(negotiated.max_frame_size, 8192);
        assert_eq!(negotiated.mode, ForwardingMode::Multiplexed);
        assert_eq!(negotiated.max_chunk(), 8192 - 5);
        assert_eq!(reply.message_type, MessageType::HandshakeComplete);
    }

    #[test]
    fn test_client_rejects_unoffered_version() {
        let mut client = ClientHandshake::new(&ChannelConfig::default(), "s-1", "");
        client.start(Instant::now()).unwrap();
        let err = client
            .on_message(&response(2, 8192, vec![]), Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnsupportedVersion { selected: 2, .. }
        ));
    }

    #[test]
    fn test_client_rejects_larger_frame_and_peer_errors() {
        let mut client = ClientHandshake::new(&ChannelConfig::default(), "s-1", "");
        client.start(Instant::now()).unwrap();

        let err = client
            .on_message(&response(1, 1 << 20, vec![]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::CapabilitiesRejected(_)));

        let err = client
            .on_message(&response(1, 8192, vec!["expired".into()]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PeerErrors(_)));
    }

    #[test]
    fn test_client_rejects_unexpected_message() {
        let mut client = ClientHandshake::new(&ChannelConfig::default(), "s-1", "");
        client.start(Instant::now()).unwrap();
        let err = client
            .on_message(&Message::data(0, Bytes::from_static(b"early")), Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnexpectedMessage(MessageType::Data)
        ));
    }

    #[test]
    fn test_agent_negotiates_with_client() {
        let client_config = ChannelConfig::default().with_window(32 * 1024, 256 * 1024);
        let agent_config = ChannelConfig::default().with_mode(ForwardingMode::Single);
        let mut client = ClientHandshake::new(&client_config, "s-9", "tok");
        let mut agent = AgentHandshake::new(&agent_config).with_token("tok");

        let now = Instant::now();
        let mut opening = client.start(now).unwrap().into_iter();
        let open = opening.next().unwrap();
        let request = opening.next().unwrap();

        assert!(matches!(agent.on_message(open).unwrap(), AgentStep::Continue));
        let reply = match agent.on_message(request).unwrap() {
            AgentStep::Reply(reply) => reply,
            other => panic!("expected reply, got {:?}", other),
        };

        let (negotiated, complete) = client.on_message(&reply, now).unwrap().unwrap();
        assert_eq!(negotiated.max_frame_size, 16 * 1024);
        assert_eq!(negotiated.mode, ForwardingMode::Single);

        match agent.on_message(complete).unwrap() {
            AgentStep::Open {
                negotiated: agent_side,
                pending,
            } => {
                assert_eq!(agent_side, negotiated);
                assert!(pending.is_none());
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_refuses_bad_token() {
        let config = ChannelConfig::default();
        let mut client = ClientHandshake::new(&config, "s-9", "wrong");
        let mut agent = AgentHandshake::new(&config).with_token("right");

        let open = client.start(Instant::now()).unwrap().remove(0);
        match agent.on_message(open).unwrap() {
            AgentStep::Refuse { reply, error } => {
                assert!(matches!(error, HandshakeError::Rejected(_)));
                let err = client.on_message(&reply, Instant::now()).unwrap_err();
                assert!(matches!(err, HandshakeError::PeerErrors(_)));
            }
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_opens_on_first_data() {
        let config = ChannelConfig::default();
        let mut client = ClientHandshake::new(&config, "s-9", "");
        let mut agent = AgentHandshake::new(&config);

        for msg in client.start(Instant::now()).unwrap() {
            agent.on_message(msg).unwrap();
        }
        let data = Message::data(0, Segment::open(1).encode());
        match agent.on_message(data).unwrap() {
            AgentStep::Open { pending, .. } => {
                assert_eq!(pending.unwrap().message_type, MessageType::Data);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_refuses_without_common_version() {
        let mut agent = AgentHandshake::new(&ChannelConfig::default());
        let open = Message::control_json(
            MessageType::ChannelOpen,
            &ChannelOpen {
                session_id: "s".into(),
                token: String::new(),
                client_version: "test".into(),
            },
        )
        .unwrap();
        agent.on_message(open).unwrap();

        let request = Message::control_json(
            MessageType::HandshakeRequest,
            &HandshakeRequest {
                schema_versions: vec![5, 6],
                capabilities: Capabilities {
                    max_frame_size: 4096,
                    multiplexing: true,
                },
                client_version: "test".into(),
            },
        )
        .unwrap();
        assert!(matches!(
            agent.on_message(request).unwrap(),
            AgentStep::Refuse {
                error: HandshakeError::NoCommonVersion(_),
                ..
            }
        ));
    }
}
