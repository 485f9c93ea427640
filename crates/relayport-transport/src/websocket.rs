//! WebSocket transport implementation using tokio-tungstenite
//!
//! The relay exposes the session stream as a WebSocket endpoint. Every
//! outgoing chunk becomes one binary message; incoming binary messages are
//! handed up as raw chunks. Ping/pong is handled by tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::{DuplexTransport, TransportError, TransportReceiver, TransportResult, TransportSender};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    url: String,
    stream: WsStream,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .finish()
    }
}

impl WebSocketTransport {
    /// Open the session stream, presenting `token` as a bearer credential
    pub async fn connect(stream_url: &str, token: &str) -> TransportResult<Self> {
        let mut request = stream_url
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))?;

        debug!(
            "WebSocket connected to {} (status {})",
            stream_url,
            response.status()
        );

        Ok(Self {
            url: stream_url.to_string(),
            stream,
        })
    }
}

impl DuplexTransport for WebSocketTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let (sink, source) = self.stream.split();
        (
            Box::new(WebSocketSender { sink }),
            Box::new(WebSocketReceiver { source }),
        )
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketSender {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSender for WebSocketSender {
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

struct WebSocketReceiver {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    trace!("WebSocket keepalive");
                }
                Some(Ok(other)) => {
                    warn!("Ignoring non-binary WebSocket message: {:?}", other);
                }
                Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let result = WebSocketTransport::connect("not a url", "token").await;
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
