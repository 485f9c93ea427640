//! Plain TCP transport, used for direct agent connections and local testing

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{DuplexTransport, TransportReceiver, TransportResult, TransportSender};

const READ_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Connect to a relay or agent listening on `addr`
    pub async fn connect(addr: &str) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("TCP transport connected to {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }
}

impl DuplexTransport for TcpTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(TcpSender { write }),
            Box::new(TcpReceiver {
                read,
                buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            }),
        )
    }

    fn describe(&self) -> String {
        match self.peer {
            Some(peer) => format!("tcp://{}", peer),
            None => "tcp://unknown".to_string(),
        }
    }
}

struct TcpSender {
    write: OwnedWriteHalf,
}

#[async_trait]
impl TransportSender for TcpSender {
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        self.write.write_all(&data).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

struct TcpReceiver {
    read: OwnedReadHalf,
    buffer: BytesMut,
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        self.buffer.reserve(READ_BUFFER_SIZE);
        let n = self.read.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer.split().freeze()))
    }
}
