//! Scheme-based transport selection

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::tcp::TcpTransport;
use crate::websocket::WebSocketTransport;
use crate::{DuplexTransport, TransportError, TransportProvider, TransportResult};

/// Picks the transport from the stream URL scheme
///
/// - `ws://` / `wss://` → [`WebSocketTransport`]
/// - `tcp://host:port` → [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct DefaultTransportProvider {
    connect_timeout: Duration,
}

impl DefaultTransportProvider {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for DefaultTransportProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportProvider for DefaultTransportProvider {
    async fn connect(
        &self,
        stream_url: &str,
        token: &str,
    ) -> TransportResult<Box<dyn DuplexTransport>> {
        let url = Url::parse(stream_url).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid stream URL '{}': {}", stream_url, e))
        })?;

        let transport = tokio::time::timeout(
            self.connect_timeout,
            connect_url(&url, stream_url, token),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        info!("✅ Transport connected: {}", transport.describe());
        Ok(transport)
    }
}

async fn connect_url(
    url: &Url,
    stream_url: &str,
    token: &str,
) -> TransportResult<Box<dyn DuplexTransport>> {
    match url.scheme() {
        "ws" | "wss" => {
            let transport = WebSocketTransport::connect(stream_url, token).await?;
            Ok(Box::new(transport))
        }
        "tcp" => {
            let host = url.host_str().ok_or_else(|| {
                TransportError::ConfigurationError(format!(
                    "Missing host in stream URL '{}'",
                    stream_url
                ))
            })?;
            let port = url.port().ok_or_else(|| {
                TransportError::ConfigurationError(format!(
                    "Missing port in stream URL '{}'",
                    stream_url
                ))
            })?;
            let transport = TcpTransport::connect(&format!("{}:{}", host, port)).await?;
            Ok(Box::new(transport))
        }
        other => Err(TransportError::ConfigurationError(format!(
            "Unsupported stream URL scheme '{}'",
            other
        ))),
    }
}
