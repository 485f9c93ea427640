//! Forwarding session orchestration
//!
//! Setup runs in phases: resolve, create-session, bind, connect, handshake.
//! Once the channel is open the multiplexer (or forwarder) runs alongside the
//! channel coordinator until shutdown, peer close, or failure.

use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relayport_transport::{DuplexTransport, TransportProvider};

use crate::channel::{spawn_channel, ChannelEnd, ChannelSummary, ChannelTask, OpenChannel, Role};
use crate::config::ChannelConfig;
use crate::error::SessionError;
use crate::external::{SessionBroker, TargetResolver};
use crate::forwarder::Forwarder;
use crate::handshake::{AgentHandshake, ClientHandshake};
use crate::multiplexer::{MuxSummary, Multiplexer};

/// What to forward and where
#[derive(Debug, Clone)]
pub struct ForwardingRequest {
    /// Target name or id
    pub target: String,
    pub remote_port: u16,
    /// Local listen address; port 0 picks a free port
    pub local_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown after the channel opened
    Shutdown,
    /// The peer closed the channel
    PeerClosed,
    /// Shutdown was requested before the channel opened
    CancelledDuringSetup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub retransmissions: u64,
}

impl SessionSummary {
    fn cancelled() -> Self {
        Self {
            end: SessionEnd::CancelledDuringSetup,
            bytes_sent: 0,
            bytes_received: 0,
            connections: 0,
            retransmissions: 0,
        }
    }

    fn from_parts(channel: ChannelSummary, mux: MuxSummary) -> Self {
        let end = match channel.end {
            ChannelEnd::Shutdown => SessionEnd::Shutdown,
            ChannelEnd::PeerClosed => SessionEnd::PeerClosed,
            ChannelEnd::Cancelled => SessionEnd::CancelledDuringSetup,
        };
        Self {
            end,
            bytes_sent: channel.bytes_sent,
            bytes_received: channel.bytes_received,
            connections: mux.connections,
            retransmissions: channel.retransmissions,
        }
    }
}

/// Run `fut` unless `cancel` fires first
async fn unless_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

/// Initiating side with its local listener already bound
pub struct ForwardingSession {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ChannelConfig,
}

impl ForwardingSession {
    /// Validate `config` and bind the local listener
    pub async fn bind(addr: SocketAddr, config: ChannelConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SessionError::LocalBind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SessionError::LocalBind { addr, source })?;

        info!("🌐 Listening for local connections on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handshake over `transport` and forward until shutdown or failure
    pub async fn run(
        self,
        transport: Box<dyn DuplexTransport>,
        session_id: &str,
        token: &str,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError> {
        let handshake = ClientHandshake::new(&self.config, session_id, token);
        let handle = spawn_channel(
            transport,
            Role::Initiator(handshake),
            self.config.clone(),
            cancel.clone(),
        );
        let channel = match handle.opened().await {
            Ok(channel) => channel,
            Err(SessionError::Cancelled) => return Ok(SessionSummary::cancelled()),
            Err(e) => return Err(e),
        };

        info!("✅ Forwarding {} through session {}", self.local_addr, session_id);
        let OpenChannel {
            negotiated,
            segments,
            events,
            task,
            ..
        } = channel;
        let mux = Multiplexer::new(self.listener, &negotiated, segments, events);
        let stop = cancel.child_token();
        finish(task, mux.run(stop.clone()), stop).await
    }
}

/// Responding side: forwards every opened connection to `target`
pub struct AgentSession {
    target: String,
    config: ChannelConfig,
    token: Option<String>,
}

impl AgentSession {
    pub fn new(target: impl Into<String>, config: ChannelConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            target: target.into(),
            config,
            token: None,
        })
    }

    /// Require peers to present `token` in `channel_open`
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub async fn serve(
        self,
        transport: Box<dyn DuplexTransport>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError> {
        let mut handshake = AgentHandshake::new(&self.config);
        if let Some(token) = &self.token {
            handshake = handshake.with_token(token.clone());
        }
        let handle = spawn_channel(
            transport,
            Role::Responder(handshake),
            self.config.clone(),
            cancel.clone(),
        );
        let channel = match handle.opened().await {
            Ok(channel) => channel,
            Err(SessionError::Cancelled) => return Ok(SessionSummary::cancelled()),
            Err(e) => return Err(e),
        };

        info!("✅ Channel open, forwarding to {}", self.target);
        let OpenChannel {
            negotiated,
            segments,
            events,
            task,
            ..
        } = channel;
        let forwarder = Forwarder::new(&self.target, &self.config, &negotiated, segments, events);
        let stop = cancel.child_token();
        finish(task, forwarder.run(stop.clone()), stop).await
    }
}

/// Run the connection side until the channel ends, then collect both summaries
///
/// `stop` must be the token `connections` watches.
async fn finish<F>(
    task: ChannelTask,
    connections: F,
    stop: CancellationToken,
) -> Result<SessionSummary, SessionError>
where
    F: Future<Output = MuxSummary> + Send + 'static,
{
    let connections = tokio::spawn(connections);
    let channel = task.join().await;
    stop.cancel();

    let mux = match connections.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Connection task ended abnormally: {}", e);
            MuxSummary::default()
        }
    };
    channel.map(|summary| SessionSummary::from_parts(summary, mux))
}

/// Resolve, create a session, bind, connect, and forward until done
pub async fn run_forwarding_session(
    request: &ForwardingRequest,
    resolver: &dyn TargetResolver,
    broker: &dyn SessionBroker,
    provider: &dyn TransportProvider,
    config: ChannelConfig,
    cancel: CancellationToken,
) -> Result<SessionSummary, SessionError> {
    config.validate()?;

    let Some(target) = unless_cancelled(&cancel, resolver.resolve(&request.target)).await else {
        return Ok(SessionSummary::cancelled());
    };
    let target = target?;
    info!("🎯 Resolved {} to {}", request.target, target);

    let Some(grant) =
        unless_cancelled(&cancel, broker.create_session(&target, request.remote_port)).await
    else {
        return Ok(SessionSummary::cancelled());
    };
    let grant = grant?;
    info!("Session {} created for {}:{}", grant.session_id, target, request.remote_port);

    let session = ForwardingSession::bind(request.local_addr, config).await?;

    let Some(transport) =
        unless_cancelled(&cancel, provider.connect(&grant.stream_url, &grant.token)).await
    else {
        return Ok(SessionSummary::cancelled());
    };
    let transport = transport.map_err(SessionError::Connect)?;

    session
        .run(transport, &grant.session_id, &grant.token, cancel)
        .await
}
