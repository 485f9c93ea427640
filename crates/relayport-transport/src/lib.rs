//! Transport abstraction layer for the relay channel
//!
//! The session engine only needs an opaque duplex byte stream: bytes written
//! on one side come out on the other, possibly split or coalesced at
//! arbitrary boundaries. Establishing that stream (TLS, WebSocket upgrade,
//! proxies) happens here, behind [`TransportProvider`], so the protocol
//! engine never depends on a concrete transport.
//!
//! ```text
//!   relayport-session ──uses──▶ DuplexTransport ──split──▶ TransportSender
//!                                                      └──▶ TransportReceiver
//!                                      ▲
//!              ┌───────────────────────┼───────────────────────┐
//!        WebSocketTransport       TcpTransport           MemoryTransport
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use thiserror::Error;

pub mod memory;
pub mod provider;
pub mod tcp;
pub mod websocket;

pub use memory::{memory_pair, FrameFilter, MemoryTransport};
pub use provider::DefaultTransportProvider;
pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Transport closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a duplex transport
#[async_trait]
pub trait TransportSender: Send {
    /// Send bytes to the peer
    async fn send(&mut self, data: Bytes) -> TransportResult<()>;

    /// Close the sending direction and release the transport
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a duplex transport
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next chunk of bytes
    ///
    /// Returns `None` once the peer has closed the stream. Chunk boundaries
    /// carry no meaning.
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;
}

/// A connected duplex byte stream whose halves suspend independently
pub trait DuplexTransport: Send + Debug {
    /// Split into independently owned write and read halves
    fn split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>);

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Establishes the duplex stream for a broker session
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Connect to `stream_url`, presenting `token` to the relay
    async fn connect(
        &self,
        stream_url: &str,
        token: &str,
    ) -> TransportResult<Box<dyn DuplexTransport>>;
}
