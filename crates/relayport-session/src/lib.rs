//! Reliable port-forwarding sessions over a message channel
//!
//! A session binds a local TCP listener and carries every accepted connection
//! through one ordered, acknowledged channel to a remote agent, which dials the
//! target service and pumps the bytes back.
//!
//! # Layers
//!
//! - [`handshake`]: channel_open / handshake_request / response / complete
//! - [`sequencer`]: byte-offset numbering and in-order reassembly
//! - [`governor`]: window accounting and retransmission
//! - [`channel`]: the coordinator task tying the above to a transport
//! - [`multiplexer`] / [`forwarder`]: local connections on either end
//! - [`session`]: setup phases and the public entry points

pub mod channel;
pub mod config;
pub mod error;
pub mod external;
pub mod forwarder;
pub mod governor;
pub mod handshake;
pub mod multiplexer;
pub mod sequencer;
pub mod session;
pub mod state;

pub use channel::{
    spawn_channel, ChannelEnd, ChannelEvent, ChannelHandle, ChannelSnapshot, ChannelSummary,
    ChannelTask, OpenChannel, Role,
};
pub use config::{ChannelConfig, ForwardingMode};
pub use error::{ChannelFailure, ConfigError, HandshakeError, SessionError, SessionPhase};
pub use external::{
    BrokerError, RemoteTargetId, ResolveError, SessionBroker, SessionGrant, StaticBroker,
    StaticResolver, TargetEntry, TargetResolver,
};
pub use forwarder::Forwarder;
pub use handshake::{AgentHandshake, ClientHandshake, Negotiated, CLIENT_VERSION};
pub use multiplexer::{ConnectionState, Multiplexer, MuxSummary};
pub use session::{
    run_forwarding_session, AgentSession, ForwardingRequest, ForwardingSession, SessionEnd,
    SessionSummary,
};
pub use state::ChannelPhase;
